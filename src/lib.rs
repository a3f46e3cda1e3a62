use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::error::Error as StdError;
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    TemplateParse(String),
    UnsupportedSelector(String),
    SelectorNotFound(String),
    MissingShadowRoot(String),
    UndeclaredEventType {
        event_type: String,
        declared: Vec<String>,
    },
    Runtime(String),
    AssertionFailed {
        selector: String,
        expected: String,
        actual: String,
        dom_snippet: String,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TemplateParse(msg) => write!(f, "template parse error: {msg}"),
            Self::UnsupportedSelector(selector) => write!(f, "unsupported selector: {selector}"),
            Self::SelectorNotFound(selector) => write!(f, "selector not found: {selector}"),
            Self::MissingShadowRoot(tag) => {
                write!(f, "<{tag}> element does not have a shadow root")
            }
            Self::UndeclaredEventType {
                event_type,
                declared,
            } => {
                if declared.is_empty() {
                    write!(
                        f,
                        "the harness is not recording '{event_type}' events; construct it with event_types = [\"{event_type}\"]"
                    )
                } else {
                    let listed = declared
                        .iter()
                        .map(|name| format!("\"{name}\""))
                        .collect::<Vec<_>>()
                        .join(", ");
                    write!(
                        f,
                        "the harness is not recording '{event_type}' events; declared event types are [{listed}]; construct it with event_types = [{listed}, \"{event_type}\"]"
                    )
                }
            }
            Self::Runtime(msg) => write!(f, "harness runtime error: {msg}"),
            Self::AssertionFailed {
                selector,
                expected,
                actual,
                dom_snippet,
            } => write!(
                f,
                "assertion failed for {selector}: expected {expected}, actual {actual}, snippet {dom_snippet}"
            ),
        }
    }
}

impl StdError for Error {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
enum NodeKind {
    Document,
    Fragment,
    ShadowRoot,
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone)]
struct Element {
    tag_name: String,
    attrs: HashMap<String, String>,
    shadow_root: Option<NodeId>,
}

#[derive(Debug, Clone)]
struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    kind: NodeKind,
}

#[derive(Debug, Clone)]
struct Dom {
    nodes: Vec<Node>,
    root: NodeId,
}

impl Dom {
    fn new() -> Self {
        let root = Node {
            parent: None,
            children: Vec::new(),
            kind: NodeKind::Document,
        };
        Self {
            nodes: vec![root],
            root: NodeId(0),
        }
    }

    fn create_node(&mut self, parent: Option<NodeId>, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            parent,
            children: Vec::new(),
            kind,
        });
        if let Some(parent_id) = parent {
            self.nodes[parent_id.0].children.push(id);
        }
        id
    }

    fn create_element(
        &mut self,
        parent: NodeId,
        tag_name: String,
        attrs: HashMap<String, String>,
    ) -> NodeId {
        let element = Element {
            tag_name,
            attrs,
            shadow_root: None,
        };
        self.create_node(Some(parent), NodeKind::Element(element))
    }

    fn create_text(&mut self, parent: NodeId, text: String) -> NodeId {
        self.create_node(Some(parent), NodeKind::Text(text))
    }

    fn create_fragment(&mut self) -> NodeId {
        self.create_node(None, NodeKind::Fragment)
    }

    fn attach_shadow_root(&mut self, host: NodeId) -> Result<NodeId> {
        let shadow = NodeId(self.nodes.len());
        let element = self
            .element_mut(host)
            .ok_or_else(|| Error::Runtime("shadow root host is not an element".into()))?;
        if element.shadow_root.is_some() {
            return Err(Error::Runtime(format!(
                "<{}> already has a shadow root",
                element.tag_name
            )));
        }
        element.shadow_root = Some(shadow);
        self.nodes.push(Node {
            parent: Some(host),
            children: Vec::new(),
            kind: NodeKind::ShadowRoot,
        });
        Ok(shadow)
    }

    fn element(&self, node_id: NodeId) -> Option<&Element> {
        match &self.nodes[node_id.0].kind {
            NodeKind::Element(element) => Some(element),
            _ => None,
        }
    }

    fn element_mut(&mut self, node_id: NodeId) -> Option<&mut Element> {
        match &mut self.nodes[node_id.0].kind {
            NodeKind::Element(element) => Some(element),
            _ => None,
        }
    }

    fn tag_name(&self, node_id: NodeId) -> Option<&str> {
        self.element(node_id).map(|element| element.tag_name.as_str())
    }

    fn parent(&self, node_id: NodeId) -> Option<NodeId> {
        self.nodes[node_id.0].parent
    }

    fn children(&self, node_id: NodeId) -> &[NodeId] {
        &self.nodes[node_id.0].children
    }

    fn shadow_root_of(&self, node_id: NodeId) -> Option<NodeId> {
        self.element(node_id).and_then(|element| element.shadow_root)
    }

    fn is_valid_node(&self, node_id: NodeId) -> bool {
        node_id.0 < self.nodes.len()
    }

    fn can_have_children(&self, node_id: NodeId) -> bool {
        !matches!(self.nodes[node_id.0].kind, NodeKind::Text(_))
    }

    fn text(&self, node_id: NodeId) -> Option<&str> {
        match &self.nodes[node_id.0].kind {
            NodeKind::Text(text) => Some(text.as_str()),
            _ => None,
        }
    }

    fn set_text(&mut self, node_id: NodeId, text: &str) -> Result<()> {
        match &mut self.nodes[node_id.0].kind {
            NodeKind::Text(slot) => {
                *slot = text.to_string();
                Ok(())
            }
            _ => Err(Error::Runtime("set_text target is not a text node".into())),
        }
    }

    fn attr(&self, node_id: NodeId, name: &str) -> Option<&str> {
        self.element(node_id)
            .and_then(|element| element.attrs.get(name))
            .map(String::as_str)
    }

    fn set_attr(&mut self, node_id: NodeId, name: &str, value: &str) -> Result<()> {
        let element = self
            .element_mut(node_id)
            .ok_or_else(|| Error::Runtime("attribute target is not an element".into()))?;
        element.attrs.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn remove_attr(&mut self, node_id: NodeId, name: &str) -> Result<()> {
        let element = self
            .element_mut(node_id)
            .ok_or_else(|| Error::Runtime("attribute target is not an element".into()))?;
        element.attrs.remove(name);
        Ok(())
    }

    fn has_class(&self, node_id: NodeId, class_name: &str) -> bool {
        class_tokens(self.attr(node_id, "class"))
            .iter()
            .any(|token| token == class_name)
    }

    fn class_name(&self, node_id: NodeId) -> Result<String> {
        self.element(node_id)
            .map(|element| element.attrs.get("class").cloned().unwrap_or_default())
            .ok_or_else(|| Error::Runtime("class target is not an element".into()))
    }

    fn class_add(&mut self, node_id: NodeId, class_name: &str) -> Result<()> {
        let mut classes = class_tokens(self.attr(node_id, "class"));
        if !classes.iter().any(|token| token == class_name) {
            classes.push(class_name.to_string());
        }
        self.write_classes(node_id, &classes)
    }

    fn class_remove(&mut self, node_id: NodeId, class_name: &str) -> Result<()> {
        let mut classes = class_tokens(self.attr(node_id, "class"));
        classes.retain(|token| token != class_name);
        self.write_classes(node_id, &classes)
    }

    fn class_toggle(&mut self, node_id: NodeId, class_name: &str) -> Result<bool> {
        if self.has_class(node_id, class_name) {
            self.class_remove(node_id, class_name)?;
            Ok(false)
        } else {
            self.class_add(node_id, class_name)?;
            Ok(true)
        }
    }

    fn write_classes(&mut self, node_id: NodeId, classes: &[String]) -> Result<()> {
        let element = self
            .element_mut(node_id)
            .ok_or_else(|| Error::Runtime("class target is not an element".into()))?;
        if classes.is_empty() {
            element.attrs.remove("class");
        } else {
            element.attrs.insert("class".to_string(), classes.join(" "));
        }
        Ok(())
    }

    fn text_content(&self, node_id: NodeId) -> String {
        let mut out = String::new();
        self.collect_text(node_id, &mut out);
        out
    }

    fn collect_text(&self, node_id: NodeId, out: &mut String) {
        match &self.nodes[node_id.0].kind {
            NodeKind::Text(text) => out.push_str(text),
            _ => {
                for child in &self.nodes[node_id.0].children {
                    self.collect_text(*child, out);
                }
            }
        }
    }

    fn detach(&mut self, node_id: NodeId) {
        if let Some(parent) = self.nodes[node_id.0].parent {
            self.nodes[parent.0].children.retain(|child| *child != node_id);
            self.nodes[node_id.0].parent = None;
        }
    }

    fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
    }

    fn take_children(&mut self, parent: NodeId) -> Vec<NodeId> {
        let children = std::mem::take(&mut self.nodes[parent.0].children);
        for child in &children {
            self.nodes[child.0].parent = None;
        }
        children
    }

    fn replace_child(&mut self, parent: NodeId, old: NodeId, new: NodeId) -> Result<()> {
        self.detach(new);
        let Some(pos) = self.nodes[parent.0]
            .children
            .iter()
            .position(|child| *child == old)
        else {
            return Err(Error::Runtime(
                "replace target is not a child of its parent".into(),
            ));
        };
        self.nodes[parent.0].children[pos] = new;
        self.nodes[old.0].parent = None;
        self.nodes[new.0].parent = Some(parent);
        Ok(())
    }

    fn descendant_elements(&self, scope: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        for child in &self.nodes[scope.0].children {
            self.collect_elements(*child, &mut out);
        }
        out
    }

    fn subtree_elements(&self, start: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_elements(start, &mut out);
        out
    }

    fn collect_elements(&self, node_id: NodeId, out: &mut Vec<NodeId>) {
        if self.element(node_id).is_some() {
            out.push(node_id);
        }
        for child in &self.nodes[node_id.0].children {
            self.collect_elements(*child, out);
        }
    }

    fn previous_element_sibling(&self, node_id: NodeId) -> Option<NodeId> {
        let parent = self.parent(node_id)?;
        let children = &self.nodes[parent.0].children;
        let pos = children.iter().position(|child| *child == node_id)?;
        children[..pos]
            .iter()
            .rev()
            .copied()
            .find(|child| self.element(*child).is_some())
    }

    fn next_element_sibling(&self, node_id: NodeId) -> Option<NodeId> {
        let parent = self.parent(node_id)?;
        let children = &self.nodes[parent.0].children;
        let pos = children.iter().position(|child| *child == node_id)?;
        children[pos + 1..]
            .iter()
            .copied()
            .find(|child| self.element(*child).is_some())
    }

    fn element_child_position(&self, node_id: NodeId) -> usize {
        let Some(parent) = self.parent(node_id) else {
            return 1;
        };
        let mut position = 0usize;
        for child in &self.nodes[parent.0].children {
            if self.element(*child).is_some() {
                position += 1;
                if *child == node_id {
                    return position;
                }
            }
        }
        position.max(1)
    }

    fn query_from(&self, scope: NodeId, selector: &str) -> Result<Option<NodeId>> {
        let all = self.query_all_from(scope, selector)?;
        Ok(all.into_iter().next())
    }

    fn query_all_from(&self, scope: NodeId, selector: &str) -> Result<Vec<NodeId>> {
        let chains = parse_selector_list(selector)?;
        let mut matched = Vec::new();
        for candidate in self.descendant_elements(scope) {
            if chains
                .iter()
                .any(|chain| self.chain_matches(candidate, chain, Some(scope)))
            {
                matched.push(candidate);
            }
        }
        Ok(matched)
    }

    fn chain_matches(&self, node_id: NodeId, chain: &[ChainLink], scope: Option<NodeId>) -> bool {
        let Some(last) = chain.last() else {
            return false;
        };
        if !self.compound_matches(node_id, &last.compound, scope) {
            return false;
        }

        let mut current = node_id;
        for idx in (1..chain.len()).rev() {
            let combinator = chain[idx].combinator.unwrap_or(Combinator::Descendant);
            let wanted = &chain[idx - 1].compound;
            let matched = match combinator {
                Combinator::Child => self
                    .scoped_parent(current, scope)
                    .filter(|parent| self.compound_matches(*parent, wanted, scope)),
                Combinator::Descendant => {
                    let mut cursor = self.scoped_parent(current, scope);
                    let mut found = None;
                    while let Some(ancestor) = cursor {
                        if self.compound_matches(ancestor, wanted, scope) {
                            found = Some(ancestor);
                            break;
                        }
                        cursor = self.scoped_parent(ancestor, scope);
                    }
                    found
                }
                Combinator::NextSibling => self
                    .previous_element_sibling(current)
                    .filter(|sibling| self.compound_matches(*sibling, wanted, scope)),
                Combinator::SubsequentSibling => {
                    let mut cursor = self.previous_element_sibling(current);
                    let mut found = None;
                    while let Some(sibling) = cursor {
                        if self.compound_matches(sibling, wanted, scope) {
                            found = Some(sibling);
                            break;
                        }
                        cursor = self.previous_element_sibling(sibling);
                    }
                    found
                }
            };

            let Some(matched) = matched else {
                return false;
            };
            current = matched;
        }
        true
    }

    fn scoped_parent(&self, node_id: NodeId, scope: Option<NodeId>) -> Option<NodeId> {
        let parent = self.parent(node_id)?;
        if Some(parent) == scope {
            None
        } else {
            Some(parent)
        }
    }

    fn compound_matches(&self, node_id: NodeId, compound: &Compound, scope: Option<NodeId>) -> bool {
        let Some(element) = self.element(node_id) else {
            return false;
        };

        if let Some(tag) = &compound.tag {
            if !element.tag_name.eq_ignore_ascii_case(tag) {
                return false;
            }
        }

        if let Some(id) = &compound.id {
            if element.attrs.get("id") != Some(id) {
                return false;
            }
        }

        if compound
            .classes
            .iter()
            .any(|class_name| !self.has_class(node_id, class_name))
        {
            return false;
        }

        for check in &compound.attrs {
            let matched = match check {
                AttrCheck::Exists(name) => element.attrs.contains_key(name),
                AttrCheck::Equals(name, value) => element.attrs.get(name) == Some(value),
            };
            if !matched {
                return false;
            }
        }

        for pseudo in &compound.pseudos {
            let matched = match pseudo {
                Pseudo::FirstChild => self.previous_element_sibling(node_id).is_none(),
                Pseudo::LastChild => self.next_element_sibling(node_id).is_none(),
                Pseudo::OnlyChild => {
                    self.previous_element_sibling(node_id).is_none()
                        && self.next_element_sibling(node_id).is_none()
                }
                Pseudo::NthChild(index) => {
                    let position = self.element_child_position(node_id);
                    match index {
                        NthIndex::Exact(n) => position == *n,
                        NthIndex::Odd => position % 2 == 1,
                        NthIndex::Even => position % 2 == 0,
                    }
                }
                Pseudo::Not(chains) => !chains
                    .iter()
                    .any(|chain| self.chain_matches(node_id, chain, scope)),
            };
            if !matched {
                return false;
            }
        }

        true
    }

    fn node_label(&self, node_id: NodeId) -> String {
        if let Some(id) = self.attr(node_id, "id") {
            if !id.is_empty() {
                return format!("#{id}");
            }
        }
        self.tag_name(node_id)
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| format!("node-{}", node_id.0))
    }

    fn dump_node(&self, node_id: NodeId) -> String {
        let mut out = String::new();
        self.write_node(node_id, &mut out);
        out
    }

    fn write_node(&self, node_id: NodeId, out: &mut String) {
        match &self.nodes[node_id.0].kind {
            NodeKind::Text(text) => out.push_str(text),
            NodeKind::Element(element) => {
                out.push('<');
                out.push_str(&element.tag_name);
                let mut names = element.attrs.keys().collect::<Vec<_>>();
                names.sort();
                for name in names {
                    out.push(' ');
                    out.push_str(name);
                    out.push_str("=\"");
                    out.push_str(&element.attrs[name]);
                    out.push('"');
                }
                out.push('>');
                for child in &self.nodes[node_id.0].children {
                    self.write_node(*child, out);
                }
                out.push_str("</");
                out.push_str(&element.tag_name);
                out.push('>');
            }
            NodeKind::Document | NodeKind::Fragment | NodeKind::ShadowRoot => {
                for child in &self.nodes[node_id.0].children {
                    self.write_node(*child, out);
                }
            }
        }
    }
}

fn class_tokens(class_attr: Option<&str>) -> Vec<String> {
    class_attr
        .unwrap_or_default()
        .split_whitespace()
        .map(ToOwned::to_owned)
        .collect()
}

pub fn class_map(classes: &[(&str, bool)]) -> String {
    let mut out = String::new();
    for (name, enabled) in classes {
        if *enabled {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(name);
        }
    }
    out
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    let mut it = value.chars();
    let mut out = String::new();
    for _ in 0..max_chars {
        let Some(ch) = it.next() else {
            return out;
        };
        out.push(ch);
    }
    if it.next().is_some() {
        out.push_str("...");
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    Descendant,
    Child,
    NextSibling,
    SubsequentSibling,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AttrCheck {
    Exists(String),
    Equals(String, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NthIndex {
    Exact(usize),
    Odd,
    Even,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pseudo {
    FirstChild,
    LastChild,
    OnlyChild,
    NthChild(NthIndex),
    Not(Vec<SelectorChain>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<AttrCheck>,
    pseudos: Vec<Pseudo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ChainLink {
    combinator: Option<Combinator>,
    compound: Compound,
}

type SelectorChain = Vec<ChainLink>;

struct SelectorCursor<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> SelectorCursor<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn done(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|byte| byte.is_ascii_whitespace()) {
            self.bump();
        }
    }

    fn take_ident(&mut self) -> Option<String> {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_byte) {
            self.bump();
        }
        if self.pos == start {
            None
        } else {
            Some(self.src[start..self.pos].to_string())
        }
    }

    fn error(&self) -> Error {
        Error::UnsupportedSelector(self.src.to_string())
    }
}

fn is_ident_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_'
}

fn parse_selector_list(selector: &str) -> Result<Vec<SelectorChain>> {
    let trimmed = selector.trim();
    if trimmed.is_empty() {
        return Err(Error::UnsupportedSelector(selector.to_string()));
    }
    let mut chains = Vec::new();
    for group in split_selector_groups(trimmed)? {
        chains.push(parse_chain(group)?);
    }
    Ok(chains)
}

fn split_selector_groups(selector: &str) -> Result<Vec<&str>> {
    let unsupported = || Error::UnsupportedSelector(selector.to_string());
    let mut groups = Vec::new();
    let mut bracket_depth = 0usize;
    let mut paren_depth = 0usize;
    let mut start = 0usize;

    for (idx, ch) in selector.char_indices() {
        match ch {
            '[' => bracket_depth += 1,
            ']' => bracket_depth = bracket_depth.checked_sub(1).ok_or_else(unsupported)?,
            '(' => paren_depth += 1,
            ')' => paren_depth = paren_depth.checked_sub(1).ok_or_else(unsupported)?,
            ',' if bracket_depth == 0 && paren_depth == 0 => {
                let group = selector[start..idx].trim();
                if group.is_empty() {
                    return Err(unsupported());
                }
                groups.push(group);
                start = idx + 1;
            }
            _ => {}
        }
    }

    if bracket_depth != 0 || paren_depth != 0 {
        return Err(unsupported());
    }
    let last = selector[start..].trim();
    if last.is_empty() {
        return Err(unsupported());
    }
    groups.push(last);
    Ok(groups)
}

fn parse_chain(group: &str) -> Result<SelectorChain> {
    let mut cursor = SelectorCursor::new(group);
    let mut links: SelectorChain = Vec::new();
    let mut pending: Option<Combinator> = None;

    loop {
        cursor.skip_ws();
        if cursor.done() {
            break;
        }
        if let Some(combinator) = cursor.peek().and_then(combinator_from_symbol) {
            if pending.is_some() || links.is_empty() {
                return Err(cursor.error());
            }
            pending = Some(combinator);
            cursor.bump();
            continue;
        }
        let compound = parse_compound(&mut cursor)?;
        let combinator = if links.is_empty() {
            None
        } else {
            Some(pending.take().unwrap_or(Combinator::Descendant))
        };
        links.push(ChainLink {
            combinator,
            compound,
        });
    }

    if links.is_empty() || pending.is_some() {
        return Err(Error::UnsupportedSelector(group.to_string()));
    }
    Ok(links)
}

fn combinator_from_symbol(byte: u8) -> Option<Combinator> {
    match byte {
        b'>' => Some(Combinator::Child),
        b'+' => Some(Combinator::NextSibling),
        b'~' => Some(Combinator::SubsequentSibling),
        _ => None,
    }
}

fn parse_compound(cursor: &mut SelectorCursor<'_>) -> Result<Compound> {
    let mut compound = Compound::default();
    let mut any_part = false;

    loop {
        let Some(byte) = cursor.peek() else {
            break;
        };
        match byte {
            b'*' => {
                if any_part {
                    return Err(cursor.error());
                }
                cursor.bump();
            }
            b'#' => {
                cursor.bump();
                let ident = cursor.take_ident().ok_or_else(|| cursor.error())?;
                if compound.id.replace(ident).is_some() {
                    return Err(cursor.error());
                }
            }
            b'.' => {
                cursor.bump();
                let ident = cursor.take_ident().ok_or_else(|| cursor.error())?;
                compound.classes.push(ident);
            }
            b'[' => compound.attrs.push(parse_attr_check(cursor)?),
            b':' => compound.pseudos.push(parse_pseudo(cursor)?),
            b'>' | b'+' | b'~' => break,
            byte if byte.is_ascii_whitespace() => break,
            _ => {
                if any_part {
                    return Err(cursor.error());
                }
                let ident = cursor.take_ident().ok_or_else(|| cursor.error())?;
                compound.tag = Some(ident.to_ascii_lowercase());
            }
        }
        any_part = true;
    }

    if !any_part {
        return Err(cursor.error());
    }
    Ok(compound)
}

fn parse_attr_check(cursor: &mut SelectorCursor<'_>) -> Result<AttrCheck> {
    cursor.bump();
    cursor.skip_ws();
    let name = cursor
        .take_ident()
        .ok_or_else(|| cursor.error())?
        .to_ascii_lowercase();
    cursor.skip_ws();
    match cursor.peek() {
        Some(b']') => {
            cursor.bump();
            Ok(AttrCheck::Exists(name))
        }
        Some(b'=') => {
            cursor.bump();
            cursor.skip_ws();
            let value = parse_attr_check_value(cursor)?;
            cursor.skip_ws();
            if cursor.peek() != Some(b']') {
                return Err(cursor.error());
            }
            cursor.bump();
            Ok(AttrCheck::Equals(name, value))
        }
        _ => Err(cursor.error()),
    }
}

fn parse_attr_check_value(cursor: &mut SelectorCursor<'_>) -> Result<String> {
    match cursor.peek() {
        Some(quote @ (b'"' | b'\'')) => {
            cursor.bump();
            let start = cursor.pos;
            while cursor.peek().is_some_and(|byte| byte != quote) {
                cursor.bump();
            }
            if cursor.done() {
                return Err(cursor.error());
            }
            let value = cursor.src[start..cursor.pos].to_string();
            cursor.bump();
            Ok(value)
        }
        Some(_) => cursor.take_ident().ok_or_else(|| cursor.error()),
        None => Err(cursor.error()),
    }
}

fn parse_pseudo(cursor: &mut SelectorCursor<'_>) -> Result<Pseudo> {
    cursor.bump();
    let name = cursor
        .take_ident()
        .ok_or_else(|| cursor.error())?
        .to_ascii_lowercase();
    match name.as_str() {
        "first-child" => Ok(Pseudo::FirstChild),
        "last-child" => Ok(Pseudo::LastChild),
        "only-child" => Ok(Pseudo::OnlyChild),
        "nth-child" => {
            let arg = parse_paren_argument(cursor)?;
            Ok(Pseudo::NthChild(parse_nth_index(&arg)?))
        }
        "not" => {
            let arg = parse_paren_argument(cursor)?;
            Ok(Pseudo::Not(parse_selector_list(&arg)?))
        }
        _ => Err(cursor.error()),
    }
}

fn parse_paren_argument(cursor: &mut SelectorCursor<'_>) -> Result<String> {
    if cursor.peek() != Some(b'(') {
        return Err(cursor.error());
    }
    cursor.bump();
    let start = cursor.pos;
    let mut depth = 1usize;
    loop {
        match cursor.peek() {
            None => return Err(cursor.error()),
            Some(b'(') => depth += 1,
            Some(b')') => {
                depth -= 1;
                if depth == 0 {
                    let arg = cursor.src[start..cursor.pos].to_string();
                    cursor.bump();
                    return Ok(arg);
                }
            }
            Some(_) => {}
        }
        cursor.bump();
    }
}

fn parse_nth_index(arg: &str) -> Result<NthIndex> {
    let arg = arg.trim();
    if arg.eq_ignore_ascii_case("odd") {
        return Ok(NthIndex::Odd);
    }
    if arg.eq_ignore_ascii_case("even") {
        return Ok(NthIndex::Even);
    }
    arg.parse::<usize>()
        .ok()
        .filter(|n| *n > 0)
        .map(NthIndex::Exact)
        .ok_or_else(|| Error::UnsupportedSelector(format!(":nth-child({arg})")))
}

const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

fn is_void_tag(tag: &str) -> bool {
    VOID_TAGS.iter().any(|void| tag.eq_ignore_ascii_case(void))
}

fn is_tag_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_'
}

fn is_attr_name_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' || byte == b':'
}

fn is_bare_value_byte(byte: u8) -> bool {
    !byte.is_ascii_whitespace() && byte != b'>' && byte != b'/' && byte != b'<'
}

struct TemplateParser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> TemplateParser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn parse_into(mut self, dom: &mut Dom, parent: NodeId) -> Result<()> {
        let bytes = self.src.as_bytes();
        let mut stack = vec![parent];

        while self.pos < bytes.len() {
            if self.src[self.pos..].starts_with("<!--") {
                match self.src[self.pos + 4..].find("-->") {
                    Some(offset) => self.pos += 4 + offset + 3,
                    None => return Err(Error::TemplateParse("unclosed comment".into())),
                }
                continue;
            }

            if self.src[self.pos..].starts_with("</") {
                let tag = self.parse_end_tag()?;
                while stack.len() > 1 {
                    let Some(top) = stack.pop() else {
                        break;
                    };
                    if dom
                        .tag_name(top)
                        .is_some_and(|name| name.eq_ignore_ascii_case(&tag))
                    {
                        break;
                    }
                }
                continue;
            }

            if bytes[self.pos] == b'<' {
                let (tag, attrs, self_closing) = self.parse_start_tag()?;
                let parent_node = *stack
                    .last()
                    .ok_or_else(|| Error::TemplateParse("lost insertion point".into()))?;
                let node = dom.create_element(parent_node, tag.clone(), attrs);
                if !self_closing && !is_void_tag(&tag) {
                    stack.push(node);
                }
                continue;
            }

            let start = self.pos;
            while self.pos < bytes.len() && bytes[self.pos] != b'<' {
                self.pos += 1;
            }
            let text = &self.src[start..self.pos];
            if !text.is_empty() {
                let parent_node = *stack
                    .last()
                    .ok_or_else(|| Error::TemplateParse("lost insertion point".into()))?;
                dom.create_text(parent_node, text.to_string());
            }
        }

        Ok(())
    }

    fn parse_start_tag(&mut self) -> Result<(String, HashMap<String, String>, bool)> {
        let bytes = self.src.as_bytes();
        self.pos += 1;
        let tag = self.take_name(is_tag_byte).to_ascii_lowercase();
        if tag.is_empty() {
            return Err(Error::TemplateParse("empty tag name".into()));
        }

        let mut attrs = HashMap::new();
        let mut self_closing = false;

        loop {
            self.skip_ws();
            match bytes.get(self.pos) {
                None => {
                    return Err(Error::TemplateParse(format!("unclosed <{tag}> start tag")));
                }
                Some(b'>') => {
                    self.pos += 1;
                    break;
                }
                Some(b'/') if bytes.get(self.pos + 1) == Some(&b'>') => {
                    self_closing = true;
                    self.pos += 2;
                    break;
                }
                Some(_) => {
                    let name = self.take_name(is_attr_name_byte).to_ascii_lowercase();
                    if name.is_empty() {
                        return Err(Error::TemplateParse(format!(
                            "invalid attribute in <{tag}>"
                        )));
                    }
                    self.skip_ws();
                    let value = if bytes.get(self.pos) == Some(&b'=') {
                        self.pos += 1;
                        self.skip_ws();
                        self.parse_attr_value(&tag)?
                    } else {
                        "true".to_string()
                    };
                    attrs.insert(name, value);
                }
            }
        }

        Ok((tag, attrs, self_closing))
    }

    fn parse_end_tag(&mut self) -> Result<String> {
        let bytes = self.src.as_bytes();
        self.pos += 2;
        self.skip_ws();
        let tag = self.take_name(is_tag_byte).to_ascii_lowercase();
        if tag.is_empty() {
            return Err(Error::TemplateParse("empty end tag".into()));
        }
        while self.pos < bytes.len() && bytes[self.pos] != b'>' {
            self.pos += 1;
        }
        if self.pos >= bytes.len() {
            return Err(Error::TemplateParse(format!("unclosed </{tag}> end tag")));
        }
        self.pos += 1;
        Ok(tag)
    }

    fn parse_attr_value(&mut self, tag: &str) -> Result<String> {
        let bytes = self.src.as_bytes();
        match bytes.get(self.pos) {
            Some(&quote) if quote == b'"' || quote == b'\'' => {
                self.pos += 1;
                let start = self.pos;
                while self.pos < bytes.len() && bytes[self.pos] != quote {
                    self.pos += 1;
                }
                if self.pos >= bytes.len() {
                    return Err(Error::TemplateParse(format!(
                        "unclosed attribute value in <{tag}>"
                    )));
                }
                let value = self.src[start..self.pos].to_string();
                self.pos += 1;
                Ok(value)
            }
            Some(_) => {
                let value = self.take_name(is_bare_value_byte);
                if value.is_empty() {
                    return Err(Error::TemplateParse(format!(
                        "missing attribute value in <{tag}>"
                    )));
                }
                Ok(value.to_string())
            }
            None => Err(Error::TemplateParse(format!(
                "missing attribute value in <{tag}>"
            ))),
        }
    }

    fn take_name(&mut self, accept: fn(u8) -> bool) -> &'a str {
        let bytes = self.src.as_bytes();
        let start = self.pos;
        while self.pos < bytes.len() && accept(bytes[self.pos]) {
            self.pos += 1;
        }
        &self.src[start..self.pos]
    }

    fn skip_ws(&mut self) {
        let bytes = self.src.as_bytes();
        while self.pos < bytes.len() && bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    event_type: String,
    target: NodeId,
    current_target: NodeId,
    detail: Option<String>,
    default_prevented: bool,
    propagation_stopped: bool,
    immediate_propagation_stopped: bool,
}

impl Event {
    fn new(event_type: &str, target: NodeId, detail: Option<String>) -> Self {
        Self {
            event_type: event_type.to_string(),
            target,
            current_target: target,
            detail,
            default_prevented: false,
            propagation_stopped: false,
            immediate_propagation_stopped: false,
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn current_target(&self) -> NodeId {
        self.current_target
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub fn prevent_default(&mut self) {
        self.default_prevented = true;
    }

    pub fn default_prevented(&self) -> bool {
        self.default_prevented
    }

    pub fn stop_propagation(&mut self) {
        self.propagation_stopped = true;
    }

    pub fn stop_immediate_propagation(&mut self) {
        self.propagation_stopped = true;
        self.immediate_propagation_stopped = true;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub event_type: String,
    pub event: Event,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ListenerHandler {
    Record,
    Component { host: NodeId, callback: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Listener {
    capture: bool,
    handler: ListenerHandler,
}

#[derive(Debug, Default)]
struct ListenerStore {
    map: HashMap<NodeId, HashMap<String, Vec<Listener>>>,
}

impl ListenerStore {
    fn add(&mut self, node_id: NodeId, event: String, listener: Listener) {
        self.map
            .entry(node_id)
            .or_default()
            .entry(event)
            .or_default()
            .push(listener);
    }

    fn remove(
        &mut self,
        node_id: NodeId,
        event: &str,
        capture: bool,
        handler: &ListenerHandler,
    ) -> bool {
        let Some(events) = self.map.get_mut(&node_id) else {
            return false;
        };
        let Some(listeners) = events.get_mut(event) else {
            return false;
        };

        if let Some(pos) = listeners
            .iter()
            .position(|listener| listener.capture == capture && listener.handler == *handler)
        {
            listeners.remove(pos);
            if listeners.is_empty() {
                events.remove(event);
            }
            if events.is_empty() {
                self.map.remove(&node_id);
            }
            return true;
        }

        false
    }

    fn get(&self, node_id: NodeId, event: &str, capture: bool) -> Vec<Listener> {
        self.map
            .get(&node_id)
            .and_then(|events| events.get(event))
            .map(|listeners| {
                listeners
                    .iter()
                    .filter(|listener| listener.capture == capture)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub trait Component: Any {
    fn render(&self) -> String;

    fn uses_shadow_dom(&self) -> bool {
        true
    }

    fn connected(&mut self, ctx: &mut ComponentCtx<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn updated(&mut self, ctx: &mut ComponentCtx<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn handle_event(
        &mut self,
        callback: &str,
        event: &mut Event,
        ctx: &mut ComponentCtx<'_>,
    ) -> Result<()> {
        let _ = (callback, event, ctx);
        Ok(())
    }
}

pub type ComponentFactory = fn() -> Box<dyn Component>;

#[derive(Clone, Default)]
pub struct CustomElementRegistry {
    factories: HashMap<String, ComponentFactory>,
}

impl CustomElementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, tag: &str, factory: ComponentFactory) -> Result<()> {
        let tag = tag.to_ascii_lowercase();
        if !tag.contains('-') {
            return Err(Error::Runtime(format!(
                "custom element name must contain a hyphen: {tag}"
            )));
        }
        if self.factories.contains_key(&tag) {
            return Err(Error::Runtime(format!(
                "custom element already defined: {tag}"
            )));
        }
        self.factories.insert(tag, factory);
        Ok(())
    }

    pub fn is_defined(&self, tag: &str) -> bool {
        self.factories.contains_key(&tag.to_ascii_lowercase())
    }

    fn factory(&self, tag: &str) -> Option<ComponentFactory> {
        self.factories.get(&tag.to_ascii_lowercase()).copied()
    }
}

pub struct TestDocument {
    dom: Dom,
    registry: CustomElementRegistry,
    listeners: ListenerStore,
    components: HashMap<NodeId, Box<dyn Component>>,
    connected_hosts: HashSet<NodeId>,
    committed_templates: HashMap<NodeId, String>,
    pending_updates: Vec<NodeId>,
    recorded_events: Vec<RecordedEvent>,
    update_step_limit: usize,
    trace: bool,
    trace_events: bool,
    trace_updates: bool,
    trace_fixture: bool,
    trace_logs: Vec<String>,
    trace_log_limit: usize,
    trace_to_stderr: bool,
}

impl TestDocument {
    pub fn new(registry: CustomElementRegistry) -> Self {
        Self {
            dom: Dom::new(),
            registry,
            listeners: ListenerStore::default(),
            components: HashMap::new(),
            connected_hosts: HashSet::new(),
            committed_templates: HashMap::new(),
            pending_updates: Vec::new(),
            recorded_events: Vec::new(),
            update_step_limit: 1_000,
            trace: false,
            trace_events: true,
            trace_updates: true,
            trace_fixture: true,
            trace_logs: Vec::new(),
            trace_log_limit: 10_000,
            trace_to_stderr: true,
        }
    }

    pub fn root(&self) -> NodeId {
        self.dom.root
    }

    pub fn enable_trace(&mut self, enabled: bool) {
        self.trace = enabled;
    }

    pub fn take_trace_logs(&mut self) -> Vec<String> {
        std::mem::take(&mut self.trace_logs)
    }

    pub fn set_trace_stderr(&mut self, enabled: bool) {
        self.trace_to_stderr = enabled;
    }

    pub fn set_trace_events(&mut self, enabled: bool) {
        self.trace_events = enabled;
    }

    pub fn set_trace_updates(&mut self, enabled: bool) {
        self.trace_updates = enabled;
    }

    pub fn set_trace_fixture(&mut self, enabled: bool) {
        self.trace_fixture = enabled;
    }

    pub fn set_trace_log_limit(&mut self, max_entries: usize) -> Result<()> {
        if max_entries == 0 {
            return Err(Error::Runtime(
                "set_trace_log_limit requires at least 1 entry".into(),
            ));
        }
        self.trace_log_limit = max_entries;
        while self.trace_logs.len() > self.trace_log_limit {
            self.trace_logs.remove(0);
        }
        Ok(())
    }

    pub fn set_update_step_limit(&mut self, max_steps: usize) -> Result<()> {
        if max_steps == 0 {
            return Err(Error::Runtime(
                "set_update_step_limit requires at least 1 step".into(),
            ));
        }
        self.update_step_limit = max_steps;
        Ok(())
    }

    pub fn insert_template(&mut self, parent: NodeId, template: &str) -> Result<Vec<NodeId>> {
        if !self.dom.is_valid_node(parent) || !self.dom.can_have_children(parent) {
            return Err(Error::Runtime(
                "template insertion parent cannot hold children".into(),
            ));
        }
        let fragment = self.parse_fragment(template)?;
        let inserted = self.dom.take_children(fragment);
        for node in &inserted {
            self.dom.append_child(parent, *node);
        }
        for node in &inserted {
            self.upgrade_subtree(*node)?;
        }
        Ok(inserted)
    }

    fn parse_fragment(&mut self, template: &str) -> Result<NodeId> {
        let fragment = self.dom.create_fragment();
        TemplateParser::new(template).parse_into(&mut self.dom, fragment)?;
        Ok(fragment)
    }

    fn upgrade_subtree(&mut self, start: NodeId) -> Result<()> {
        for node in self.dom.subtree_elements(start) {
            if self.components.contains_key(&node) {
                continue;
            }
            let registered = self
                .dom
                .tag_name(node)
                .is_some_and(|tag| self.registry.is_defined(tag));
            if registered {
                self.upgrade_element(node)?;
            }
        }
        Ok(())
    }

    fn upgrade_element(&mut self, host: NodeId) -> Result<()> {
        let tag = self
            .dom
            .tag_name(host)
            .ok_or_else(|| Error::Runtime("upgrade target is not an element".into()))?
            .to_string();
        let factory = self
            .registry
            .factory(&tag)
            .ok_or_else(|| Error::Runtime(format!("no definition for custom element: {tag}")))?;
        let component = factory();
        if component.uses_shadow_dom() {
            self.dom.attach_shadow_root(host)?;
        }
        self.components.insert(host, component);
        let label = self.dom.node_label(host);
        self.trace_fixture_line(format!("[fixture] upgrade tag=<{tag}> host={label}"));
        self.commit_template(host)?;
        self.ensure_connected(host)?;
        Ok(())
    }

    pub fn ensure_connected(&mut self, host: NodeId) -> Result<()> {
        if self.connected_hosts.contains(&host) {
            return Ok(());
        }
        self.connected_hosts.insert(host);
        self.with_component_entry(host, |component, ctx| component.connected(ctx))
    }

    pub fn is_upgraded(&self, node_id: NodeId) -> bool {
        self.components.contains_key(&node_id)
    }

    fn render_root(&self, host: NodeId) -> NodeId {
        self.dom.shadow_root_of(host).unwrap_or(host)
    }

    fn commit_template(&mut self, host: NodeId) -> Result<()> {
        let component = self.components.remove(&host).ok_or_else(|| {
            Error::Runtime(format!(
                "no component instance bound to {}",
                self.dom.node_label(host)
            ))
        })?;
        let markup = component.render();
        self.components.insert(host, component);

        let target = self.render_root(host);
        let new_fragment = self.parse_fragment(&markup)?;
        match self.committed_templates.get(&host).cloned() {
            None => {
                let children = self.dom.take_children(new_fragment);
                for child in &children {
                    self.dom.append_child(target, *child);
                }
                for child in &children {
                    self.upgrade_subtree(*child)?;
                }
            }
            Some(previous) => {
                let prev_fragment = self.parse_fragment(&previous)?;
                self.patch_children(target, prev_fragment, new_fragment)?;
            }
        }
        self.committed_templates.insert(host, markup);
        let label = self.dom.node_label(host);
        self.trace_update_line(format!("[update] commit host={label}"));
        Ok(())
    }

    fn patch_children(&mut self, live: NodeId, prev: NodeId, new: NodeId) -> Result<()> {
        let live_children = self.dom.children(live).to_vec();
        let prev_children = self.dom.children(prev).to_vec();
        let new_children = self.dom.children(new).to_vec();

        if prev_children.len() != new_children.len() || live_children.len() != prev_children.len()
        {
            return self.rebuild_children(live, new);
        }
        for idx in 0..new_children.len() {
            self.patch_node(live_children[idx], prev_children[idx], new_children[idx])?;
        }
        Ok(())
    }

    fn rebuild_children(&mut self, live: NodeId, new: NodeId) -> Result<()> {
        self.dom.take_children(live);
        let children = self.dom.take_children(new);
        for child in &children {
            self.dom.append_child(live, *child);
        }
        for child in &children {
            self.upgrade_subtree(*child)?;
        }
        Ok(())
    }

    fn patch_node(&mut self, live: NodeId, prev: NodeId, new: NodeId) -> Result<()> {
        let prev_text = self.dom.text(prev).map(ToOwned::to_owned);
        let new_text = self.dom.text(new).map(ToOwned::to_owned);
        if let (Some(prev_text), Some(new_text)) = (prev_text, new_text) {
            if self.dom.text(live).is_none() {
                return self.replace_node(live, new);
            }
            if prev_text != new_text {
                self.dom.set_text(live, &new_text)?;
            }
            return Ok(());
        }

        let live_tag = self.dom.tag_name(live).map(ToOwned::to_owned);
        let prev_tag = self.dom.tag_name(prev).map(ToOwned::to_owned);
        let new_tag = self.dom.tag_name(new).map(ToOwned::to_owned);
        match (live_tag, prev_tag, new_tag) {
            (Some(live_tag), Some(prev_tag), Some(new_tag))
                if live_tag == prev_tag && prev_tag == new_tag =>
            {
                self.patch_attrs(live, prev, new)?;
                self.patch_children(live, prev, new)
            }
            _ => self.replace_node(live, new),
        }
    }

    // Only attributes whose templated value changed are written, so direct
    // mutations to untemplated attributes survive re-renders.
    fn patch_attrs(&mut self, live: NodeId, prev: NodeId, new: NodeId) -> Result<()> {
        let prev_attrs = self
            .dom
            .element(prev)
            .map(|element| element.attrs.clone())
            .unwrap_or_default();
        let new_attrs = self
            .dom
            .element(new)
            .map(|element| element.attrs.clone())
            .unwrap_or_default();

        for (name, value) in &new_attrs {
            if prev_attrs.get(name) != Some(value) {
                self.dom.set_attr(live, name, value)?;
            }
        }
        for name in prev_attrs.keys() {
            if !new_attrs.contains_key(name) {
                self.dom.remove_attr(live, name)?;
            }
        }
        Ok(())
    }

    fn replace_node(&mut self, live: NodeId, new: NodeId) -> Result<()> {
        let Some(parent) = self.dom.parent(live) else {
            return Err(Error::Runtime("cannot replace a detached node".into()));
        };
        self.dom.replace_child(parent, live, new)?;
        self.upgrade_subtree(new)
    }

    pub fn request_update(&mut self, host: NodeId) {
        let label = self.dom.node_label(host);
        if self.pending_updates.contains(&host) {
            self.trace_update_line(format!("[update] request host={label} coalesced"));
            return;
        }
        self.pending_updates.push(host);
        self.trace_update_line(format!("[update] request host={label} queued"));
    }

    pub fn has_pending_updates(&self) -> bool {
        !self.pending_updates.is_empty()
    }

    pub fn flush_updates(&mut self) -> Result<Vec<NodeId>> {
        let mut committed = Vec::new();
        let mut steps = 0usize;
        while !self.pending_updates.is_empty() {
            steps += 1;
            if steps > self.update_step_limit {
                return Err(self.update_step_limit_error(self.update_step_limit, steps));
            }
            let host = self.pending_updates.remove(0);
            self.commit_template(host)?;
            self.run_updated(host)?;
            committed.push(host);
        }
        self.trace_update_line(format!("[update] flush ran={}", committed.len()));
        Ok(committed)
    }

    fn update_step_limit_error(&self, max_steps: usize, steps: usize) -> Error {
        let next_host = self
            .pending_updates
            .first()
            .map(|host| self.dom.node_label(*host))
            .unwrap_or_else(|| "none".into());
        Error::Runtime(format!(
            "flush exceeded max update steps (possible render loop): limit={max_steps}, steps={steps}, pending_hosts={}, next_host={next_host}",
            self.pending_updates.len()
        ))
    }

    fn run_updated(&mut self, host: NodeId) -> Result<()> {
        self.with_component_entry(host, |component, ctx| component.updated(ctx))
    }

    pub fn dispatch_event(
        &mut self,
        target: NodeId,
        event_type: &str,
        detail: Option<String>,
    ) -> Result<Event> {
        if !self.dom.is_valid_node(target) {
            return Err(Error::Runtime("dispatch target is not a valid node".into()));
        }
        let mut event = Event::new(event_type, target, detail);

        let mut ancestors = Vec::new();
        let mut cursor = self.dom.parent(target);
        while let Some(node) = cursor {
            ancestors.push(node);
            cursor = self.dom.parent(node);
        }
        ancestors.reverse();

        // Capture phase.
        for node in &ancestors {
            event.current_target = *node;
            self.invoke_listeners(*node, &mut event, true)?;
            if event.propagation_stopped {
                self.trace_event_done(&event, "propagation_stopped");
                return Ok(event);
            }
        }

        // Target phase: capture listeners first.
        event.current_target = target;
        self.invoke_listeners(target, &mut event, true)?;
        if event.propagation_stopped {
            self.trace_event_done(&event, "propagation_stopped");
            return Ok(event);
        }
        self.invoke_listeners(target, &mut event, false)?;
        if event.propagation_stopped {
            self.trace_event_done(&event, "propagation_stopped");
            return Ok(event);
        }

        // Bubble phase.
        for node in ancestors.iter().rev() {
            event.current_target = *node;
            self.invoke_listeners(*node, &mut event, false)?;
            if event.propagation_stopped {
                self.trace_event_done(&event, "propagation_stopped");
                return Ok(event);
            }
        }

        self.trace_event_done(&event, "completed");
        Ok(event)
    }

    fn invoke_listeners(
        &mut self,
        node_id: NodeId,
        event: &mut Event,
        capture: bool,
    ) -> Result<()> {
        let listeners = self.listeners.get(node_id, event.event_type(), capture);
        for listener in listeners {
            if self.trace && self.trace_events {
                let phase = if capture { "capture" } else { "bubble" };
                let line = format!(
                    "[event] {} target={} current={} phase={}",
                    event.event_type(),
                    self.dom.node_label(event.target()),
                    self.dom.node_label(node_id),
                    phase
                );
                self.trace_line(line);
            }
            match listener.handler {
                ListenerHandler::Record => {
                    self.recorded_events.push(RecordedEvent {
                        event_type: event.event_type().to_string(),
                        event: event.clone(),
                    });
                }
                ListenerHandler::Component { host, callback } => {
                    if self.components.contains_key(&host) {
                        self.with_component_entry(host, |component, ctx| {
                            component.handle_event(&callback, event, ctx)
                        })?;
                    } else {
                        let line = format!(
                            "[event] skip {} host={} (component busy)",
                            event.event_type(),
                            self.dom.node_label(host)
                        );
                        self.trace_event_line(line);
                    }
                }
            }
            if event.immediate_propagation_stopped {
                break;
            }
        }
        Ok(())
    }

    fn trace_event_done(&mut self, event: &Event, outcome: &str) {
        let target_label = self.dom.node_label(event.target());
        let line = format!(
            "[event] done {} target={target_label} outcome={outcome} default_prevented={}",
            event.event_type(),
            event.default_prevented()
        );
        self.trace_event_line(line);
    }

    fn add_record_listener(&mut self, node_id: NodeId, event_type: &str) {
        self.listeners.add(
            node_id,
            event_type.to_string(),
            Listener {
                capture: false,
                handler: ListenerHandler::Record,
            },
        );
    }

    pub fn add_component_listener(
        &mut self,
        target: NodeId,
        event_type: &str,
        capture: bool,
        host: NodeId,
        callback: &str,
    ) {
        self.listeners.add(
            target,
            event_type.to_string(),
            Listener {
                capture,
                handler: ListenerHandler::Component {
                    host,
                    callback: callback.to_string(),
                },
            },
        );
    }

    pub fn remove_component_listener(
        &mut self,
        target: NodeId,
        event_type: &str,
        capture: bool,
        host: NodeId,
        callback: &str,
    ) -> bool {
        self.listeners.remove(
            target,
            event_type,
            capture,
            &ListenerHandler::Component {
                host,
                callback: callback.to_string(),
            },
        )
    }

    pub fn recorded_events(&self) -> &[RecordedEvent] {
        &self.recorded_events
    }

    pub fn query_from(&self, scope: NodeId, selector: &str) -> Result<Option<NodeId>> {
        self.dom.query_from(scope, selector)
    }

    pub fn query_all_from(&self, scope: NodeId, selector: &str) -> Result<Vec<NodeId>> {
        self.dom.query_all_from(scope, selector)
    }

    pub fn select_in(&self, scope: NodeId, selector: &str) -> Result<NodeId> {
        self.dom
            .query_from(scope, selector)?
            .ok_or_else(|| Error::SelectorNotFound(selector.to_string()))
    }

    pub fn tag_name(&self, node_id: NodeId) -> Option<&str> {
        self.dom.tag_name(node_id)
    }

    pub fn shadow_root_of(&self, node_id: NodeId) -> Option<NodeId> {
        self.dom.shadow_root_of(node_id)
    }

    pub fn attr(&self, node_id: NodeId, name: &str) -> Option<&str> {
        self.dom.attr(node_id, name)
    }

    pub fn set_attr(&mut self, node_id: NodeId, name: &str, value: &str) -> Result<()> {
        self.dom.set_attr(node_id, name, value)
    }

    pub fn remove_attr(&mut self, node_id: NodeId, name: &str) -> Result<()> {
        self.dom.remove_attr(node_id, name)
    }

    pub fn class_name(&self, node_id: NodeId) -> Result<String> {
        self.dom.class_name(node_id)
    }

    pub fn class_contains(&self, node_id: NodeId, class_name: &str) -> bool {
        self.dom.has_class(node_id, class_name)
    }

    pub fn class_add(&mut self, node_id: NodeId, class_name: &str) -> Result<()> {
        self.dom.class_add(node_id, class_name)
    }

    pub fn class_remove(&mut self, node_id: NodeId, class_name: &str) -> Result<()> {
        self.dom.class_remove(node_id, class_name)
    }

    pub fn class_toggle(&mut self, node_id: NodeId, class_name: &str) -> Result<bool> {
        self.dom.class_toggle(node_id, class_name)
    }

    pub fn text_content(&self, node_id: NodeId) -> String {
        self.dom.text_content(node_id)
    }

    pub fn node_label(&self, node_id: NodeId) -> String {
        self.dom.node_label(node_id)
    }

    pub fn node_snippet(&self, node_id: NodeId) -> String {
        truncate_chars(&self.dom.dump_node(node_id), 200)
    }

    pub fn dump_node(&self, node_id: NodeId) -> String {
        self.dom.dump_node(node_id)
    }

    fn first_upgraded(&self, roots: &[NodeId]) -> Option<NodeId> {
        let mut stack: Vec<NodeId> = roots.iter().rev().copied().collect();
        while let Some(node) = stack.pop() {
            if self.components.contains_key(&node) {
                return Some(node);
            }
            for child in self.dom.children(node).iter().rev() {
                stack.push(*child);
            }
        }
        None
    }

    fn with_component_entry<R>(
        &mut self,
        host: NodeId,
        f: impl FnOnce(&mut Box<dyn Component>, &mut ComponentCtx<'_>) -> Result<R>,
    ) -> Result<R> {
        let mut component = self.components.remove(&host).ok_or_else(|| {
            Error::Runtime(format!(
                "no component instance bound to {}",
                self.dom.node_label(host)
            ))
        })?;
        let result = {
            let mut ctx = ComponentCtx { doc: self, host };
            f(&mut component, &mut ctx)
        };
        self.components.insert(host, component);
        result
    }

    pub fn with_component_mut<C: Component, R>(
        &mut self,
        host: NodeId,
        f: impl FnOnce(&mut C, &mut ComponentCtx<'_>) -> Result<R>,
    ) -> Result<R> {
        self.with_component_entry(host, |component, ctx| {
            let any: &mut dyn Any = &mut **component;
            let Some(typed) = any.downcast_mut::<C>() else {
                return Err(Error::Runtime(
                    "component bound to the element has a different concrete type".into(),
                ));
            };
            f(typed, ctx)
        })
    }

    pub fn with_component<C: Component, R>(
        &self,
        host: NodeId,
        f: impl FnOnce(&C) -> R,
    ) -> Result<R> {
        let component = self.components.get(&host).ok_or_else(|| {
            Error::Runtime(format!(
                "no component instance bound to {}",
                self.dom.node_label(host)
            ))
        })?;
        let any: &dyn Any = &**component;
        let Some(typed) = any.downcast_ref::<C>() else {
            return Err(Error::Runtime(
                "component bound to the element has a different concrete type".into(),
            ));
        };
        Ok(f(typed))
    }

    fn trace_event_line(&mut self, line: String) {
        if self.trace && self.trace_events {
            self.trace_line(line);
        }
    }

    fn trace_update_line(&mut self, line: String) {
        if self.trace && self.trace_updates {
            self.trace_line(line);
        }
    }

    fn trace_fixture_line(&mut self, line: String) {
        if self.trace && self.trace_fixture {
            self.trace_line(line);
        }
    }

    fn trace_line(&mut self, line: String) {
        if self.trace {
            if self.trace_to_stderr {
                eprintln!("{line}");
            }
            if self.trace_logs.len() >= self.trace_log_limit {
                self.trace_logs.remove(0);
            }
            self.trace_logs.push(line);
        }
    }
}

pub struct ComponentCtx<'a> {
    doc: &'a mut TestDocument,
    host: NodeId,
}

impl ComponentCtx<'_> {
    pub fn host(&self) -> NodeId {
        self.host
    }

    pub fn shadow_root(&self) -> Result<NodeId> {
        self.doc.dom.shadow_root_of(self.host).ok_or_else(|| {
            let tag = self
                .doc
                .dom
                .tag_name(self.host)
                .unwrap_or("unknown")
                .to_string();
            Error::MissingShadowRoot(tag)
        })
    }

    fn render_root(&self) -> NodeId {
        self.doc.render_root(self.host)
    }

    pub fn query_one(&self, selector: &str) -> Result<NodeId> {
        self.doc.select_in(self.render_root(), selector)
    }

    pub fn query_all(&self, selector: &str) -> Result<Vec<NodeId>> {
        self.doc.query_all_from(self.render_root(), selector)
    }

    pub fn has_match(&self, selector: &str) -> Result<bool> {
        Ok(self
            .doc
            .query_from(self.render_root(), selector)?
            .is_some())
    }

    pub fn attr(&self, node_id: NodeId, name: &str) -> Option<&str> {
        self.doc.attr(node_id, name)
    }

    pub fn set_attr(&mut self, node_id: NodeId, name: &str, value: &str) -> Result<()> {
        self.doc.set_attr(node_id, name, value)
    }

    pub fn class_add(&mut self, node_id: NodeId, class_name: &str) -> Result<()> {
        self.doc.class_add(node_id, class_name)
    }

    pub fn class_remove(&mut self, node_id: NodeId, class_name: &str) -> Result<()> {
        self.doc.class_remove(node_id, class_name)
    }

    pub fn class_contains(&self, node_id: NodeId, class_name: &str) -> bool {
        self.doc.class_contains(node_id, class_name)
    }

    pub fn text_content(&self, node_id: NodeId) -> String {
        self.doc.text_content(node_id)
    }

    pub fn request_update(&mut self) {
        self.doc.request_update(self.host);
    }

    pub fn dispatch(&mut self, event_type: &str, detail: Option<String>) -> Result<Event> {
        self.doc.dispatch_event(self.host, event_type, detail)
    }

    pub fn listen(&mut self, target: NodeId, event_type: &str, callback: &str) {
        self.doc
            .add_component_listener(target, event_type, false, self.host, callback);
    }

    pub fn listen_capture(&mut self, target: NodeId, event_type: &str, callback: &str) {
        self.doc
            .add_component_listener(target, event_type, true, self.host, callback);
    }

    pub fn unlisten(&mut self, target: NodeId, event_type: &str, callback: &str) -> bool {
        self.doc
            .remove_component_listener(target, event_type, false, self.host, callback)
    }
}

const FIXTURE_STACK_BYTES: usize = 32 * 1024 * 1024;

pub struct TestHarness {
    doc: TestDocument,
    element: NodeId,
    event_types: Vec<String>,
}

impl std::fmt::Debug for TestHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestHarness")
            .field("element", &self.element)
            .field("event_types", &self.event_types)
            .finish_non_exhaustive()
    }
}

impl TestHarness {
    pub fn new(mut doc: TestDocument, element: NodeId, event_types: &[&str]) -> Result<Self> {
        if !doc.is_upgraded(element) {
            return Err(Error::Runtime(format!(
                "{} is not an upgraded custom element",
                doc.node_label(element)
            )));
        }
        for event_type in event_types {
            doc.add_record_listener(element, event_type);
        }
        Ok(Self {
            doc,
            element,
            event_types: event_types.iter().map(|name| name.to_string()).collect(),
        })
    }

    pub fn fixture(
        registry: &CustomElementRegistry,
        template: &str,
        event_types: &[&str],
    ) -> Result<Self> {
        stacker::grow(FIXTURE_STACK_BYTES, || {
            Self::fixture_impl(registry, template, event_types)
        })
    }

    fn fixture_impl(
        registry: &CustomElementRegistry,
        template: &str,
        event_types: &[&str],
    ) -> Result<Self> {
        let mut doc = TestDocument::new(registry.clone());
        let root = doc.root();
        let inserted = doc.insert_template(root, template)?;
        let element = doc.first_upgraded(&inserted).ok_or_else(|| {
            Error::Runtime("template does not contain a registered custom element".into())
        })?;
        doc.ensure_connected(element)?;
        doc.flush_updates()?;
        Self::new(doc, element, event_types)
    }

    pub fn element(&self) -> NodeId {
        self.element
    }

    pub fn document(&self) -> &TestDocument {
        &self.doc
    }

    pub fn document_mut(&mut self) -> &mut TestDocument {
        &mut self.doc
    }

    pub fn event_types(&self) -> &[String] {
        &self.event_types
    }

    pub fn shadow_root(&self) -> Result<NodeId> {
        self.doc.shadow_root_of(self.element).ok_or_else(|| {
            let tag = self
                .doc
                .tag_name(self.element)
                .unwrap_or("unknown")
                .to_string();
            Error::MissingShadowRoot(tag)
        })
    }

    pub fn query_one(&self, selector: &str) -> Result<NodeId> {
        let shadow = self.shadow_root()?;
        self.doc.select_in(shadow, selector)
    }

    pub fn query_all(&self, selector: &str) -> Result<Vec<NodeId>> {
        let shadow = self.shadow_root()?;
        self.doc.query_all_from(shadow, selector)
    }

    pub fn has_match(&self, selector: &str) -> Result<bool> {
        let shadow = self.shadow_root()?;
        Ok(self.doc.query_from(shadow, selector)?.is_some())
    }

    pub fn last_event(&self, event_type: &str) -> Result<Option<&Event>> {
        if !self.event_types.iter().any(|name| name == event_type) {
            return Err(Error::UndeclaredEventType {
                event_type: event_type.to_string(),
                declared: self.event_types.clone(),
            });
        }
        Ok(self
            .doc
            .recorded_events()
            .iter()
            .rev()
            .find(|recorded| recorded.event_type == event_type)
            .map(|recorded| &recorded.event))
    }

    pub fn events(&self) -> &[RecordedEvent] {
        self.doc.recorded_events()
    }

    pub fn update_complete(&mut self) -> Result<bool> {
        let committed = self.doc.flush_updates()?;
        Ok(committed.contains(&self.element))
    }

    pub fn with_component_mut<C: Component, R>(
        &mut self,
        f: impl FnOnce(&mut C, &mut ComponentCtx<'_>) -> Result<R>,
    ) -> Result<R> {
        self.doc.with_component_mut(self.element, f)
    }

    pub fn with_component<C: Component, R>(&self, f: impl FnOnce(&C) -> R) -> Result<R> {
        self.doc.with_component(self.element, f)
    }

    pub fn click(&mut self, selector: &str) -> Result<Event> {
        self.dispatch(selector, "click")
    }

    pub fn dispatch(&mut self, selector: &str, event_type: &str) -> Result<Event> {
        let target = self.query_one(selector)?;
        self.doc.dispatch_event(target, event_type, None)
    }

    pub fn dispatch_on_element(
        &mut self,
        event_type: &str,
        detail: Option<&str>,
    ) -> Result<Event> {
        self.doc
            .dispatch_event(self.element, event_type, detail.map(ToOwned::to_owned))
    }

    pub fn text(&self, selector: &str) -> Result<String> {
        let target = self.query_one(selector)?;
        Ok(self.doc.text_content(target))
    }

    pub fn class_name(&self, selector: &str) -> Result<String> {
        let target = self.query_one(selector)?;
        self.doc.class_name(target)
    }

    pub fn assert_text(&self, selector: &str, expected: &str) -> Result<()> {
        let target = self.query_one(selector)?;
        let actual = self.doc.text_content(target);
        if actual != expected {
            return Err(Error::AssertionFailed {
                selector: selector.to_string(),
                expected: expected.to_string(),
                actual,
                dom_snippet: self.doc.node_snippet(target),
            });
        }
        Ok(())
    }

    pub fn assert_class(&self, selector: &str, expected: &str) -> Result<()> {
        let target = self.query_one(selector)?;
        let actual = self.doc.class_name(target)?;
        if actual != expected {
            return Err(Error::AssertionFailed {
                selector: selector.to_string(),
                expected: expected.to_string(),
                actual,
                dom_snippet: self.doc.node_snippet(target),
            });
        }
        Ok(())
    }

    pub fn enable_trace(&mut self, enabled: bool) {
        self.doc.enable_trace(enabled);
    }

    pub fn take_trace_logs(&mut self) -> Vec<String> {
        self.doc.take_trace_logs()
    }
}
