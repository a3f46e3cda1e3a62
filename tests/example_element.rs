use element_tester::{
    class_map, Component, ComponentCtx, CustomElementRegistry, Event, NodeId, Result, TestHarness,
};

#[derive(Default)]
struct ExampleElement {
    is_visible: bool,
    query_element: Option<NodeId>,
}

impl ExampleElement {
    fn new_boxed() -> Box<dyn Component> {
        Box::new(Self::default())
    }

    fn show(&mut self, ctx: &mut ComponentCtx<'_>) -> Result<()> {
        self.is_visible = true;
        let direct = ctx.query_one("#shadow-root-element")?;
        ctx.class_add(direct, "visible")?;
        if let Some(cached) = self.query_element {
            ctx.class_add(cached, "visible")?;
        }
        ctx.request_update();
        ctx.dispatch("visibility-changed", Some("visible".to_string()))?;
        Ok(())
    }
}

impl Component for ExampleElement {
    fn render(&self) -> String {
        format!(
            r#"<span id="class-map-element" class="{}"></span><span id="shadow-root-element"></span><span id="query-element"></span>"#,
            class_map(&[("visible", self.is_visible)])
        )
    }

    fn connected(&mut self, ctx: &mut ComponentCtx<'_>) -> Result<()> {
        self.query_element = Some(ctx.query_one("#query-element")?);
        Ok(())
    }
}

fn example_harness(event_types: &[&str]) -> Result<TestHarness> {
    let mut registry = CustomElementRegistry::new();
    registry.define("example-element", ExampleElement::new_boxed)?;
    TestHarness::fixture(&registry, "<example-element></example-element>", event_types)
}

fn show(harness: &mut TestHarness) -> Result<()> {
    harness.with_component_mut::<ExampleElement, _>(|element, ctx| element.show(ctx))
}

#[test]
fn can_change_element_class_using_class_map() -> Result<()> {
    let mut harness = example_harness(&["visibility-changed"])?;
    assert_eq!(harness.class_name("#class-map-element")?, "");

    show(&mut harness)?;
    assert!(harness.update_complete()?);

    assert_eq!(harness.class_name("#class-map-element")?, "visible");
    Ok(())
}

#[test]
fn can_change_element_class_using_shadow_root_lookup() -> Result<()> {
    let mut harness = example_harness(&["visibility-changed"])?;
    let target = harness.query_one("#shadow-root-element")?;
    assert_eq!(harness.class_name("#shadow-root-element")?, "");

    show(&mut harness)?;
    assert!(harness.update_complete()?);

    assert_eq!(harness.class_name("#shadow-root-element")?, "visible");
    assert_eq!(harness.query_one("#shadow-root-element")?, target);
    Ok(())
}

#[test]
fn can_change_element_class_using_cached_query_handle() -> Result<()> {
    let mut harness = example_harness(&["visibility-changed"])?;

    let cached = harness.with_component::<ExampleElement, _>(|element| element.query_element)?;
    let cached = cached.expect("query handle should be cached at connection time");
    assert_eq!(harness.document().class_name(cached)?, "");

    show(&mut harness)?;
    assert!(harness.update_complete()?);

    assert!(harness.document().class_contains(cached, "visible"));
    assert_eq!(harness.query_one("#query-element")?, cached);
    Ok(())
}

#[test]
fn show_emits_a_recordable_visibility_event() -> Result<()> {
    let mut harness = example_harness(&["visibility-changed"])?;
    assert!(harness.last_event("visibility-changed")?.is_none());

    show(&mut harness)?;
    harness.update_complete()?;

    let event = harness
        .last_event("visibility-changed")?
        .cloned()
        .expect("show should dispatch visibility-changed");
    assert_eq!(event.detail(), Some("visible"));
    assert_eq!(event.target(), harness.element());
    Ok(())
}

#[test]
fn ledger_keeps_every_dispatch_and_last_event_tracks_the_newest() -> Result<()> {
    let mut harness = example_harness(&["visibility-changed", "custom-ping"])?;

    harness.dispatch_on_element("custom-ping", Some("first"))?;
    show(&mut harness)?;
    harness.update_complete()?;
    harness.dispatch_on_element("custom-ping", Some("second"))?;

    let types = harness
        .events()
        .iter()
        .map(|recorded| recorded.event_type.as_str())
        .collect::<Vec<_>>();
    assert_eq!(types, ["custom-ping", "visibility-changed", "custom-ping"]);
    assert_eq!(
        harness.last_event("custom-ping")?.and_then(Event::detail),
        Some("second")
    );
    Ok(())
}

#[test]
fn events_bubbling_from_shadow_descendants_are_recorded() -> Result<()> {
    let mut harness = example_harness(&["custom-ping"])?;
    let inner = harness.query_one("#query-element")?;
    harness.dispatch("#query-element", "custom-ping")?;

    let recorded = harness
        .last_event("custom-ping")?
        .cloned()
        .expect("bubbled event should be recorded");
    assert_eq!(recorded.target(), inner);
    assert_eq!(recorded.current_target(), harness.element());
    Ok(())
}

#[test]
fn update_complete_reports_whether_the_element_rerendered() -> Result<()> {
    let mut harness = example_harness(&["visibility-changed"])?;
    assert!(!harness.update_complete()?);

    show(&mut harness)?;
    assert!(harness.update_complete()?);
    assert!(!harness.update_complete()?);
    Ok(())
}
