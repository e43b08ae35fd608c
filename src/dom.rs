//! Host document model
//!
//! Arena-backed DOM behind a shared lock. Markup is parsed with scraper
//! (html5ever fragment parsing) and serialized the way `innerHTML` /
//! `outerHTML` would. A removed subtree stays in the arena while any
//! [`Element`] handle still points into it, so handles held by behaviors
//! never dangle; once none does, its slots are reused.
//!
//! Each node also carries the binding flag and an optional model
//! back-reference; the engine never tracks elements itself.

use std::any::Any;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use scraper::{Html, Node};

use crate::error::NunjaError;

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

const RAW_TEXT_ELEMENTS: &[&str] = &[
    "script", "style", "xmp", "iframe", "noembed", "noframes", "plaintext",
];

/// Escape a value for use inside a double-quoted attribute
pub fn escape_attribute(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            _ => out.push(ch),
        }
    }
    out
}

fn escape_text(value: &str, out: &mut String) {
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            _ => out.push(ch),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
enum NodeKind {
    Element {
        name: String,
        attrs: Vec<(String, String)>,
    },
    Text(String),
    Comment(String),
}

struct NodeData {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    bound: bool,
    model: Option<Arc<dyn Any + Send + Sync>>,
    /// Alive while some `Element` handle refers to this node
    pin: Mutex<Weak<()>>,
    /// Bumped each time the slot is released
    generation: u64,
}

impl NodeData {
    fn new(kind: NodeKind, parent: Option<NodeId>, generation: u64) -> Self {
        Self {
            kind,
            parent,
            children: Vec::new(),
            bound: false,
            model: None,
            pin: Mutex::new(Weak::new()),
            generation,
        }
    }

    fn is_pinned(&self) -> bool {
        self.pin.lock().strong_count() > 0
    }
}

#[derive(Default)]
struct Tree {
    nodes: Vec<NodeData>,
    /// Released slots, reused by `push`
    free: Vec<NodeId>,
    /// Roots of removed subtrees not yet released
    detached: Vec<NodeId>,
}

impl Tree {
    fn push(&mut self, kind: NodeKind, parent: Option<NodeId>) -> NodeId {
        let id = match self.free.pop() {
            Some(id) => {
                let generation = self.nodes[id.0].generation;
                self.nodes[id.0] = NodeData::new(kind, parent, generation);
                id
            }
            None => {
                self.nodes.push(NodeData::new(kind, parent, 0));
                NodeId(self.nodes.len() - 1)
            }
        };
        if let Some(parent) = parent {
            self.nodes[parent.0].children.push(id);
        }
        id
    }

    fn node(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.0]
    }

    /// Parse markup into detached top-level nodes
    fn import(&mut self, markup: &str) -> Vec<NodeId> {
        let fragment = Html::parse_fragment(markup);
        let mut top = Vec::new();
        let mut pending: Vec<_> = fragment
            .root_element()
            .children()
            .rev()
            .map(|child| (None, child))
            .collect();

        while let Some((parent, node)) = pending.pop() {
            let kind = match node.value() {
                Node::Element(el) => NodeKind::Element {
                    name: el.name().to_string(),
                    attrs: el
                        .attrs()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                },
                Node::Text(text) => NodeKind::Text(String::from(&**text)),
                Node::Comment(comment) => NodeKind::Comment(String::from(&**comment)),
                _ => continue,
            };
            let is_element = matches!(kind, NodeKind::Element { .. });
            let id = self.push(kind, parent);
            if parent.is_none() {
                top.push(id);
            }
            if is_element {
                pending.extend(node.children().rev().map(|child| (Some(id), child)));
            }
        }
        top
    }

    fn detach_children(&mut self, id: NodeId) {
        let children = std::mem::take(&mut self.nodes[id.0].children);
        for child in &children {
            self.nodes[child.0].parent = None;
        }
        self.detached.extend(children);
    }

    /// The node and everything below it, any kind
    fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut found = vec![id];
        let mut next = 0;
        while let Some(current) = found.get(next).copied() {
            found.extend_from_slice(&self.node(current).children);
            next += 1;
        }
        found
    }

    /// Release every removed subtree that no handle points into
    fn reclaim(&mut self) {
        let roots = std::mem::take(&mut self.detached);
        for root in roots {
            let subtree = self.subtree(root);
            if subtree.iter().any(|id| self.node(*id).is_pinned()) {
                self.detached.push(root);
                continue;
            }
            for id in subtree {
                let node = &mut self.nodes[id.0];
                let generation = node.generation + 1;
                *node = NodeData::new(NodeKind::Comment(String::new()), None, generation);
                self.free.push(id);
            }
        }
    }

    fn adopt(&mut self, parent: NodeId, ids: &[NodeId]) {
        for id in ids {
            self.nodes[id.0].parent = Some(parent);
        }
        self.nodes[parent.0].children.extend_from_slice(ids);
    }

    fn tag(&self, id: NodeId) -> &str {
        match &self.node(id).kind {
            NodeKind::Element { name, .. } => name,
            NodeKind::Text(_) => "#text",
            NodeKind::Comment(_) => "#comment",
        }
    }

    fn attr(&self, id: NodeId, key: &str) -> Option<&str> {
        match &self.node(id).kind {
            NodeKind::Element { attrs, .. } => attrs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }

    fn serialize(&self, id: NodeId, raw_text: bool, out: &mut String) {
        match &self.node(id).kind {
            NodeKind::Text(text) if raw_text => out.push_str(text),
            NodeKind::Text(text) => escape_text(text, out),
            NodeKind::Comment(text) => {
                out.push_str("<!--");
                out.push_str(text);
                out.push_str("-->");
            }
            NodeKind::Element { name, attrs } => {
                out.push('<');
                out.push_str(name);
                for (key, value) in attrs {
                    out.push(' ');
                    out.push_str(key);
                    out.push_str("=\"");
                    out.push_str(&escape_attribute(value));
                    out.push('"');
                }
                out.push('>');
                if VOID_ELEMENTS.contains(&name.as_str()) {
                    return;
                }
                self.serialize_children(id, out);
                out.push_str("</");
                out.push_str(name);
                out.push('>');
            }
        }
    }

    fn serialize_children(&self, id: NodeId, out: &mut String) {
        let raw = RAW_TEXT_ELEMENTS.contains(&self.tag(id));
        for child in &self.node(id).children {
            self.serialize(*child, raw, out);
        }
    }

    fn text_content(&self, id: NodeId, out: &mut String) {
        match &self.node(id).kind {
            NodeKind::Text(text) => out.push_str(text),
            NodeKind::Comment(_) => {}
            NodeKind::Element { .. } => {
                for child in &self.node(id).children {
                    self.text_content(*child, out);
                }
            }
        }
    }

    fn is_element(&self, id: NodeId) -> bool {
        matches!(self.node(id).kind, NodeKind::Element { .. })
    }

    /// Element descendants of `id` in document order, `id` excluded
    fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut found = Vec::new();
        let mut stack: Vec<NodeId> = self.node(id).children.iter().rev().copied().collect();
        while let Some(next) = stack.pop() {
            if self.is_element(next) {
                found.push(next);
                stack.extend(self.node(next).children.iter().rev().copied());
            }
        }
        found
    }
}

/// Shared handle to a document; clones refer to the same tree
#[derive(Clone)]
pub struct Document {
    tree: Arc<RwLock<Tree>>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// Empty document with a `<body>` root
    pub fn new() -> Self {
        let mut tree = Tree::default();
        tree.push(
            NodeKind::Element {
                name: "body".to_string(),
                attrs: Vec::new(),
            },
            None,
        );
        Self {
            tree: Arc::new(RwLock::new(tree)),
        }
    }

    /// Document whose body holds the parsed markup
    pub fn parse(markup: &str) -> Self {
        let doc = Self::new();
        doc.body().set_inner_html(markup);
        doc
    }

    pub fn body(&self) -> Element {
        let tree = self.tree.read();
        self.element(&tree, NodeId(0))
    }

    /// Slots in the arena, released ones included
    pub fn allocated_nodes(&self) -> usize {
        self.tree.read().nodes.len()
    }

    /// Slots currently holding a node, attached or not
    pub fn live_nodes(&self) -> usize {
        let tree = self.tree.read();
        tree.nodes.len() - tree.free.len()
    }

    /// Handle to `id`, pinning the node for as long as the handle lives
    fn element(&self, tree: &Tree, id: NodeId) -> Element {
        let mut slot = tree.node(id).pin.lock();
        let pin = match slot.upgrade() {
            Some(pin) => pin,
            None => {
                let pin = Arc::new(());
                *slot = Arc::downgrade(&pin);
                pin
            }
        };
        Element {
            doc: self.clone(),
            id,
            _pin: pin,
        }
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tree = self.tree.read();
        f.debug_struct("Document")
            .field("nodes", &tree.nodes.len())
            .field("free", &tree.free.len())
            .finish()
    }
}

/// Handle to one element node
#[derive(Clone)]
pub struct Element {
    doc: Document,
    id: NodeId,
    _pin: Arc<()>,
}

impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.doc.tree, &other.doc.tree)
    }
}

impl Eq for Element {}

impl std::fmt::Debug for Element {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}#{}>", self.tag_name(), self.id.0)
    }
}

impl Element {
    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn node_id(&self) -> NodeId {
        self.id
    }

    pub fn tag_name(&self) -> String {
        self.doc.tree.read().tag(self.id).to_string()
    }

    pub fn attr(&self, key: &str) -> Option<String> {
        self.doc.tree.read().attr(self.id, key).map(str::to_string)
    }

    pub fn has_attr(&self, key: &str) -> bool {
        self.doc.tree.read().attr(self.id, key).is_some()
    }

    pub fn set_attr(&self, key: &str, value: &str) {
        let mut tree = self.doc.tree.write();
        if let NodeKind::Element { attrs, .. } = &mut tree.nodes[self.id.0].kind {
            match attrs.iter_mut().find(|(k, _)| k == key) {
                Some((_, v)) => *v = value.to_string(),
                None => attrs.push((key.to_string(), value.to_string())),
            }
        }
    }

    pub fn remove_attr(&self, key: &str) {
        let mut tree = self.doc.tree.write();
        if let NodeKind::Element { attrs, .. } = &mut tree.nodes[self.id.0].kind {
            attrs.retain(|(k, _)| k != key);
        }
    }

    pub fn id_attr(&self) -> Option<String> {
        self.attr("id")
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.attr("class")
            .is_some_and(|c| c.split_whitespace().any(|c| c == class))
    }

    pub fn add_class(&self, class: &str) {
        let current = self.attr("class").unwrap_or_default();
        if current.split_whitespace().any(|c| c == class) {
            return;
        }
        let updated = if current.trim().is_empty() {
            class.to_string()
        } else {
            format!("{} {}", current.trim_end(), class)
        };
        self.set_attr("class", &updated);
    }

    pub fn parent(&self) -> Option<Element> {
        let tree = self.doc.tree.read();
        let parent = tree.node(self.id).parent;
        parent.map(|id| self.doc.element(&tree, id))
    }

    /// Whether the element is still reachable from the body
    pub fn is_attached(&self) -> bool {
        let tree = self.doc.tree.read();
        let mut current = self.id;
        while let Some(parent) = tree.node(current).parent {
            current = parent;
        }
        current == NodeId(0)
    }

    pub fn children(&self) -> Vec<Element> {
        let tree = self.doc.tree.read();
        tree.node(self.id)
            .children
            .iter()
            .filter(|c| tree.is_element(**c))
            .map(|c| self.doc.element(&tree, *c))
            .collect()
    }

    /// Descendant elements with the given tag, in document order
    pub fn elements_by_tag(&self, tag: &str) -> Vec<Element> {
        let tree = self.doc.tree.read();
        tree.descendants(self.id)
            .into_iter()
            .filter(|id| tree.tag(*id).eq_ignore_ascii_case(tag))
            .map(|id| self.doc.element(&tree, id))
            .collect()
    }

    pub fn find_by_id(&self, id: &str) -> Option<Element> {
        let tree = self.doc.tree.read();
        tree.descendants(self.id)
            .into_iter()
            .find(|n| tree.attr(*n, "id") == Some(id))
            .map(|n| self.doc.element(&tree, n))
    }

    /// Lazy document-order walk over descendants carrying `attr`
    pub fn select_with_attr(&self, attr: &str) -> WithAttr {
        let tree = self.doc.tree.read();
        let stack = tree
            .node(self.id)
            .children
            .iter()
            .rev()
            .map(|c| (*c, tree.node(*c).generation))
            .collect();
        drop(tree);
        WithAttr {
            doc: self.doc.clone(),
            attr: attr.to_string(),
            stack,
        }
    }

    pub fn text_content(&self) -> String {
        let mut out = String::new();
        self.doc.tree.read().text_content(self.id, &mut out);
        out
    }

    pub fn inner_html(&self) -> String {
        let mut out = String::new();
        self.doc.tree.read().serialize_children(self.id, &mut out);
        out
    }

    pub fn outer_html(&self) -> String {
        let mut out = String::new();
        self.doc.tree.read().serialize(self.id, false, &mut out);
        out
    }

    /// Replace the element's content with parsed markup
    pub fn set_inner_html(&self, markup: &str) {
        let mut tree = self.doc.tree.write();
        tree.detach_children(self.id);
        tree.reclaim();
        let imported = tree.import(markup);
        tree.adopt(self.id, &imported);
    }

    /// Replace the element itself with parsed markup. Returns the first
    /// element of the replacement, if any; this handle becomes detached.
    pub fn replace_with_html(&self, markup: &str) -> Result<Option<Element>, NunjaError> {
        let mut tree = self.doc.tree.write();
        let Some(parent) = tree.node(self.id).parent else {
            return Err(NunjaError::Detached {
                tag: tree.tag(self.id).to_string(),
            });
        };

        tree.reclaim();
        let imported = tree.import(markup);
        for id in &imported {
            tree.nodes[id.0].parent = Some(parent);
        }
        let siblings = &mut tree.nodes[parent.0].children;
        let pos = siblings
            .iter()
            .position(|c| *c == self.id)
            .unwrap_or(siblings.len());
        let end = (pos + 1).min(siblings.len());
        siblings.splice(pos..end, imported.iter().copied());
        tree.nodes[self.id.0].parent = None;
        tree.detached.push(self.id);

        let first = imported.into_iter().find(|id| tree.is_element(*id));
        Ok(first.map(|id| self.doc.element(&tree, id)))
    }

    pub fn is_bound(&self) -> bool {
        self.doc.tree.read().node(self.id).bound
    }

    /// Atomically mark the element as bound; false if it already was
    pub fn claim_binding(&self) -> bool {
        let mut tree = self.doc.tree.write();
        let node = &mut tree.nodes[self.id.0];
        if node.bound {
            return false;
        }
        node.bound = true;
        true
    }

    /// Attach a behavior model as a back-reference on the node
    pub fn set_model<T: Any + Send + Sync>(&self, model: Arc<T>) {
        self.doc.tree.write().nodes[self.id.0].model = Some(model as Arc<dyn Any + Send + Sync>);
    }

    pub fn model<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let model = self.doc.tree.read().node(self.id).model.clone()?;
        model.downcast::<T>().ok()
    }
}

/// Iterator returned by [`Element::select_with_attr`]
///
/// Reads the tree one step at a time; it is finite and cannot be restarted.
/// Each node's children are taken as they were when the node was visited,
/// so a mutation made mid-scan (for instance a behavior's `set_inner_html`
/// on another worker) can yield elements that were detached since, and
/// misses nodes added below already visited ones. Slots released and
/// reused in the meantime are skipped.
pub struct WithAttr {
    doc: Document,
    attr: String,
    stack: Vec<(NodeId, u64)>,
}

impl Iterator for WithAttr {
    type Item = Element;

    fn next(&mut self) -> Option<Element> {
        let tree = self.doc.tree.read();
        while let Some((id, generation)) = self.stack.pop() {
            if tree.node(id).generation != generation || !tree.is_element(id) {
                continue;
            }
            self.stack.extend(
                tree.node(id)
                    .children
                    .iter()
                    .rev()
                    .map(|c| (*c, tree.node(*c).generation)),
            );
            if tree.attr(id, &self.attr).is_some() {
                return Some(self.doc.element(&tree, id));
            }
        }
        None
    }
}

impl std::iter::FusedIterator for WithAttr {}
