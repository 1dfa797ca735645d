//! The mutable result document.
//!
//! A tree mirroring the response shape, stored as an arena indexed by
//! [`ResultId`] so parent back-references never form ownership cycles.
//! Resolver tasks mutate the subtree at their assigned path; null propagation
//! walks parent links to the nearest nullable ancestor.

use apollo_compiler::Name;

use crate::response::JsonMap;
use crate::response::JsonValue;
use crate::response::Path;
use crate::response::PathSegment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ResultId(pub(crate) u32);

pub(crate) const ROOT_RESULT: ResultId = ResultId(0);

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ResultValue {
    /// Not yet resolved; collected as `null`.
    Unset,
    Null,
    Leaf(JsonValue),
    Object { fields: Vec<(Name, ResultId)> },
    List { items: Vec<ResultId> },
}

#[derive(Debug)]
pub(crate) struct ResultNode {
    pub(crate) parent: Option<ResultId>,
    pub(crate) path: Path,
    pub(crate) nullable: bool,
    /// Transient null-propagation bit: the node was nulled by an error or a
    /// non-null violation and must not deliver data.
    pub(crate) invalidated: bool,
    /// Excluded from the initial payload; delivered by a deferred branch.
    pub(crate) deferred: bool,
    pub(crate) value: ResultValue,
}

#[derive(Debug)]
pub(crate) struct ResultDocument {
    nodes: Vec<ResultNode>,
}

impl Default for ResultDocument {
    fn default() -> Self {
        let mut document = ResultDocument { nodes: Vec::new() };
        document.reset();
        document
    }
}

impl ResultDocument {
    /// Clears the tree back to a fresh root, keeping allocations for reuse.
    pub(crate) fn reset(&mut self) {
        self.nodes.clear();
        self.nodes.push(ResultNode {
            parent: None,
            path: Path::empty(),
            // `data` itself is nullable.
            nullable: true,
            invalidated: false,
            deferred: false,
            value: ResultValue::Unset,
        });
    }

    pub(crate) fn alloc(
        &mut self,
        parent: ResultId,
        segment: PathSegment,
        nullable: bool,
    ) -> ResultId {
        let path = self.nodes[parent.0 as usize].path.join(segment);
        let id = ResultId(self.nodes.len() as u32);
        self.nodes.push(ResultNode {
            parent: Some(parent),
            path,
            nullable,
            invalidated: false,
            deferred: false,
            value: ResultValue::Unset,
        });
        id
    }

    pub(crate) fn node(&self, id: ResultId) -> &ResultNode {
        &self.nodes[id.0 as usize]
    }

    pub(crate) fn node_mut(&mut self, id: ResultId) -> &mut ResultNode {
        &mut self.nodes[id.0 as usize]
    }

    pub(crate) fn path(&self, id: ResultId) -> Path {
        self.node(id).path.clone()
    }

    pub(crate) fn set_leaf(&mut self, id: ResultId, value: JsonValue) {
        self.node_mut(id).value = ResultValue::Leaf(value);
    }

    pub(crate) fn set_null(&mut self, id: ResultId) {
        self.node_mut(id).value = ResultValue::Null;
    }

    pub(crate) fn begin_object(&mut self, id: ResultId) {
        self.node_mut(id).value = ResultValue::Object { fields: Vec::new() };
    }

    pub(crate) fn push_object_field(&mut self, object: ResultId, name: Name, child: ResultId) {
        if let ResultValue::Object { fields } = &mut self.node_mut(object).value {
            fields.push((name, child));
        }
    }

    pub(crate) fn begin_list(&mut self, id: ResultId) {
        self.node_mut(id).value = ResultValue::List { items: Vec::new() };
    }

    pub(crate) fn push_list_item(&mut self, list: ResultId, item: ResultId) {
        if let ResultValue::List { items } = &mut self.node_mut(list).value {
            items.push(item);
        }
    }

    pub(crate) fn mark_deferred(&mut self, id: ResultId) {
        self.node_mut(id).deferred = true;
    }

    /// Nulls and invalidates a node after an error.
    pub(crate) fn invalidate(&mut self, id: ResultId) {
        let node = self.node_mut(id);
        node.value = ResultValue::Null;
        node.invalidated = true;
    }

    /// Propagates a null out of a non-nullable position: walks up the path
    /// and nulls the nearest nullable ancestor, returning it. The root node
    /// is nullable, so the walk terminates there at the latest (the whole
    /// `data` becomes null).
    pub(crate) fn propagate_null(&mut self, from: ResultId) -> ResultId {
        let mut current = from;
        loop {
            let node = self.node(current);
            if node.nullable {
                self.invalidate(current);
                return current;
            }
            let parent = node.parent;
            self.invalidate(current);
            match parent {
                Some(parent) => current = parent,
                None => return current,
            }
        }
    }

    /// `true` when the node is null or was invalidated by propagation.
    pub(crate) fn is_null_or_invalidated(&self, id: ResultId) -> bool {
        let node = self.node(id);
        node.invalidated || matches!(node.value, ResultValue::Null | ResultValue::Unset)
    }

    pub(crate) fn is_invalidated(&self, id: ResultId) -> bool {
        self.node(id).invalidated
    }

    /// Materializes the subtree rooted at `id`.
    ///
    /// Children marked deferred are skipped (they are delivered by their
    /// branches); the root of the collection is always included so a deferred
    /// branch can collect its own subtree.
    pub(crate) fn collect(&self, id: ResultId) -> JsonValue {
        self.collect_inner(id, true).unwrap_or(JsonValue::Null)
    }

    fn collect_inner(&self, id: ResultId, is_collection_root: bool) -> Option<JsonValue> {
        let node = self.node(id);
        if node.deferred && !is_collection_root {
            return None;
        }
        if node.invalidated {
            return Some(JsonValue::Null);
        }
        Some(match &node.value {
            ResultValue::Unset | ResultValue::Null => JsonValue::Null,
            ResultValue::Leaf(value) => value.clone(),
            ResultValue::Object { fields } => {
                let mut map = JsonMap::with_capacity(fields.len());
                for (name, child) in fields {
                    if let Some(value) = self.collect_inner(*child, false) {
                        map.insert(name.as_str(), value);
                    }
                }
                JsonValue::Object(map)
            }
            ResultValue::List { items } => JsonValue::Array(
                items
                    .iter()
                    .map(|item| self.collect_inner(*item, false).unwrap_or(JsonValue::Null))
                    .collect(),
            ),
        })
    }

    /// Collects only the fields a deferred branch contributed to an object.
    pub(crate) fn collect_fields(&self, id: ResultId, wanted: &[ResultId]) -> JsonValue {
        let node = self.node(id);
        if node.invalidated {
            return JsonValue::Null;
        }
        match &node.value {
            ResultValue::Object { fields } => {
                let mut map = JsonMap::new();
                for (name, child) in fields {
                    if wanted.contains(child) {
                        map.insert(
                            name.as_str(),
                            self.collect_inner(*child, true).unwrap_or(JsonValue::Null),
                        );
                    }
                }
                JsonValue::Object(map)
            }
            _ => self.collect(id),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use apollo_compiler::name;
    use serde_json_bytes::json;

    use super::*;

    #[test]
    fn collects_nested_objects_in_insertion_order() {
        let mut doc = ResultDocument::default();
        doc.begin_object(ROOT_RESULT);
        let user = doc.alloc(ROOT_RESULT, PathSegment::Field(name!("user")), true);
        doc.push_object_field(ROOT_RESULT, name!("user"), user);
        doc.begin_object(user);
        let id = doc.alloc(user, PathSegment::Field(name!("id")), false);
        doc.push_object_field(user, name!("id"), id);
        doc.set_leaf(id, json!(1));
        let name = doc.alloc(user, PathSegment::Field(name!("name")), true);
        doc.push_object_field(user, name!("name"), name);
        doc.set_leaf(name, json!("Ada"));

        assert_eq!(
            doc.collect(ROOT_RESULT),
            json!({ "user": { "id": 1, "name": "Ada" } })
        );
        assert_eq!(doc.path(name).to_string(), "/user/name");
    }

    #[test]
    fn null_propagation_stops_at_nullable_ancestor() {
        let mut doc = ResultDocument::default();
        doc.begin_object(ROOT_RESULT);
        // a: nullable object, b: non-null object, c: non-null leaf
        let a = doc.alloc(ROOT_RESULT, PathSegment::Field(name!("a")), true);
        doc.push_object_field(ROOT_RESULT, name!("a"), a);
        doc.begin_object(a);
        let b = doc.alloc(a, PathSegment::Field(name!("b")), false);
        doc.push_object_field(a, name!("b"), b);
        doc.begin_object(b);
        let c = doc.alloc(b, PathSegment::Field(name!("c")), false);
        doc.push_object_field(b, name!("c"), c);

        doc.invalidate(c);
        assert_eq!(doc.propagate_null(c), a);
        assert_eq!(doc.collect(ROOT_RESULT), json!({ "a": null }));
    }

    #[test]
    fn null_propagation_reaches_the_root() {
        let mut doc = ResultDocument::default();
        doc.begin_object(ROOT_RESULT);
        let a = doc.alloc(ROOT_RESULT, PathSegment::Field(name!("a")), false);
        doc.push_object_field(ROOT_RESULT, name!("a"), a);
        doc.invalidate(a);
        // The root node itself is nullable (data: null), so propagation is
        // handled there.
        assert_eq!(doc.propagate_null(a), ROOT_RESULT);
        assert_eq!(doc.collect(ROOT_RESULT), JsonValue::Null);
    }

    #[test]
    fn deferred_children_are_excluded_from_collection() {
        let mut doc = ResultDocument::default();
        doc.begin_object(ROOT_RESULT);
        let now = doc.alloc(ROOT_RESULT, PathSegment::Field(name!("now")), true);
        doc.push_object_field(ROOT_RESULT, name!("now"), now);
        doc.set_leaf(now, json!(1));
        let later = doc.alloc(ROOT_RESULT, PathSegment::Field(name!("later")), true);
        doc.push_object_field(ROOT_RESULT, name!("later"), later);
        doc.set_leaf(later, json!(2));
        doc.mark_deferred(later);

        assert_eq!(doc.collect(ROOT_RESULT), json!({ "now": 1 }));
        // Collecting the deferred element itself includes it.
        assert_eq!(doc.collect(later), json!(2));
    }
}
