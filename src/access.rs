//!
//! AccessEngine — the projection algorithm
//! ----------------------------------------
//! Pure, synchronous, no I/O: given a document, a path, and a caller's held
//! roles, walk the tree accumulating per-operation role policy from every
//! policy node encountered and rebuild a redacted copy of the subtree at
//! that path. See `spec.md` §4.1 for the algorithm this implements verbatim.

use std::collections::HashSet;

use serde_json::{Map, Value};

pub type RoleSet = HashSet<String>;

/// One of the six operations a policy node's `meta` can gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ReadData,
    ReadMeta,
    WriteData,
    WriteMeta,
    CreateData,
    DeleteData,
}

impl Operation {
    fn key(self) -> &'static str {
        match self {
            Operation::ReadData => "read_data",
            Operation::ReadMeta => "read_meta",
            Operation::WriteData => "write_data",
            Operation::WriteMeta => "write_meta",
            Operation::CreateData => "create_data",
            Operation::DeleteData => "delete_data",
        }
    }

    const ALL: [Operation; 6] = [
        Operation::ReadData,
        Operation::ReadMeta,
        Operation::WriteData,
        Operation::WriteMeta,
        Operation::CreateData,
        Operation::DeleteData,
    ];
}

/// The accumulated role set for each of the six operations, updated while
/// descending through policy nodes.
#[derive(Debug, Clone, Default)]
pub struct RolesPermitted {
    read_data: RoleSet,
    read_meta: RoleSet,
    write_data: RoleSet,
    write_meta: RoleSet,
    create_data: RoleSet,
    delete_data: RoleSet,
}

impl RolesPermitted {
    fn set_mut(&mut self, op: Operation) -> &mut RoleSet {
        match op {
            Operation::ReadData => &mut self.read_data,
            Operation::ReadMeta => &mut self.read_meta,
            Operation::WriteData => &mut self.write_data,
            Operation::WriteMeta => &mut self.write_meta,
            Operation::CreateData => &mut self.create_data,
            Operation::DeleteData => &mut self.delete_data,
        }
    }

    fn set(&self, op: Operation) -> &RoleSet {
        match op {
            Operation::ReadData => &self.read_data,
            Operation::ReadMeta => &self.read_meta,
            Operation::WriteData => &self.write_data,
            Operation::WriteMeta => &self.write_meta,
            Operation::CreateData => &self.create_data,
            Operation::DeleteData => &self.delete_data,
        }
    }

    /// Roles held permit `op` if `roles_held` is empty (root-equivalent) or
    /// it intersects the accumulated set for `op`.
    pub fn is_permitted(&self, op: Operation, roles_held: &RoleSet) -> bool {
        roles_held.is_empty() || self.set(op).intersection(roles_held).next().is_some()
    }

    fn roles_from_value(v: Option<&Value>) -> RoleSet {
        match v {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
            _ => RoleSet::new(),
        }
    }

    /// Update this tuple from a policy node's `meta` descriptor: every
    /// `require.K` replaces the current set for `K`; every `allow.K` unions
    /// into it; `allow.write_data`/`allow.write_meta` additionally union
    /// into `read_data`/`read_meta`.
    pub fn update_from_meta(&mut self, meta: &Value) {
        let require = meta.get("require");
        let allow = meta.get("allow");

        for op in Operation::ALL {
            if let Some(req) = require {
                if let Some(roles) = req.get(op.key()) {
                    *self.set_mut(op) = Self::roles_from_value(Some(roles));
                }
            }
        }
        for op in Operation::ALL {
            if let Some(al) = allow {
                if let Some(roles) = al.get(op.key()) {
                    let roles = Self::roles_from_value(Some(roles));
                    self.set_mut(op).extend(roles.clone());
                    if op == Operation::WriteData {
                        self.read_data.extend(roles.clone());
                    }
                    if op == Operation::WriteMeta {
                        self.read_meta.extend(roles);
                    }
                }
            }
        }
    }
}

/// A policy node is an object carrying both `data` and `meta` as object
/// siblings (I1). Any other keys on that node are ignored on read.
fn as_policy_node(node: &Value) -> Option<(&Value, &Value)> {
    let obj = node.as_object()?;
    let data = obj.get("data")?;
    let meta = obj.get("meta")?;
    if meta.is_object() {
        Some((data, meta))
    } else {
        None
    }
}

fn step<'a>(node: &'a Value, key: &str) -> Option<&'a Value> {
    match node {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

/// Walk `path`, accumulating `RolesPermitted` from every policy node
/// encountered strictly along the way, and return the node the path
/// resolves to (not yet projected) together with that accumulated tuple.
/// Returns `None` if any path element is missing.
fn descend<'a>(
    mut node: &'a Value,
    path: &[String],
    mut permitted: RolesPermitted,
) -> Option<(&'a Value, RolesPermitted)> {
    for key in path {
        if let Some((data, meta)) = as_policy_node(node) {
            permitted.update_from_meta(meta);
            node = data;
        }
        node = step(node, key)?;
    }
    Some((node, permitted))
}

/// The outcome of projecting a node: either a visible value or the
/// internal "invalid/redacted" sentinel, which is never surfaced to a
/// caller directly — `get` maps it to `null` at the top level, and nested
/// uses either omit the key (objects) or substitute `null` (policy-node
/// `data`/`meta` wrapper fields).
pub enum Projected {
    Value(Value),
    Invalid,
}

impl Projected {
    fn into_value_or_null(self) -> Value {
        match self {
            Projected::Value(v) => v,
            Projected::Invalid => Value::Null,
        }
    }
}

/// Recursively rebuild `node` into a redacted copy per `spec.md` §4.1 step 2.
fn project(node: &Value, mut permitted: RolesPermitted, roles_held: &RoleSet) -> Projected {
    if let Some((data, meta)) = as_policy_node(node) {
        permitted.update_from_meta(meta);
        if permitted.is_permitted(Operation::ReadMeta, roles_held) {
            let data_proj = project(data, permitted.clone(), roles_held).into_value_or_null();
            let meta_proj = project(meta, permitted.clone(), roles_held).into_value_or_null();
            let mut out = Map::new();
            out.insert("data".to_string(), data_proj);
            out.insert("meta".to_string(), meta_proj);
            return Projected::Value(Value::Object(out));
        }
        return project(data, permitted, roles_held);
    }

    match node {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                if let Projected::Value(pv) = project(v, permitted.clone(), roles_held) {
                    out.insert(k.clone(), pv);
                }
            }
            if permitted.is_permitted(Operation::ReadData, roles_held) || !out.is_empty() {
                Projected::Value(Value::Object(out))
            } else {
                Projected::Invalid
            }
        }
        Value::Array(items) => {
            if permitted.is_permitted(Operation::ReadData, roles_held) {
                let out: Vec<Value> = items
                    .iter()
                    .filter_map(|v| match project(v, permitted.clone(), roles_held) {
                        Projected::Value(pv) => Some(pv),
                        Projected::Invalid => None,
                    })
                    .collect();
                Projected::Value(Value::Array(out))
            } else {
                Projected::Invalid
            }
        }
        scalar => {
            if permitted.is_permitted(Operation::ReadData, roles_held) {
                Projected::Value(scalar.clone())
            } else {
                Projected::Invalid
            }
        }
    }
}

/// Run the full `Get(tree, path, rolesHeld)` algorithm: descend to `path`,
/// project from there, and map an invalid top-level result to `null`.
pub fn get(tree: &Value, path: &[String], roles_held: &RoleSet) -> Value {
    match descend(tree, path, RolesPermitted::default()) {
        Some((node, permitted)) => project(node, permitted, roles_held).into_value_or_null(),
        None => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roles(names: &[&str]) -> RoleSet {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn path(segs: &[&str]) -> Vec<String> {
        segs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn p1_admin_bypass_returns_full_subtree() {
        let doc = json!({
            "Public": "hello",
            "Secret": {"meta": {"require": {"read_data": ["admin"]}}, "data": 42}
        });
        let v = get(&doc, &path(&[]), &roles(&[]));
        assert_eq!(v, doc);
    }

    #[test]
    fn scenario_anonymous_read_redacts_gated_subtree() {
        let doc = json!({
            "data": {
                "Public": "hello",
                "Secret": {"meta": {"require": {"read_data": ["admin"]}}, "data": 42}
            }
        });
        let v = get(&doc, &path(&["data"]), &roles(&["public"]));
        assert_eq!(v, json!({"Public": "hello"}));
    }

    #[test]
    fn scenario_admin_read_of_gated_value() {
        // I3: RolesHeld = ∅ passes every check, including read_meta, so an
        // admin querying a policy node directly sees it reconstructed in
        // full (data *and* meta) rather than unwrapped to the bare data
        // value — this is still "the subtree at p, unchanged" per P1,
        // since nothing in it was redacted.
        let doc = json!({
            "Secret": {"meta": {"require": {"read_data": ["admin"]}}, "data": 42}
        });
        let v = get(&doc, &path(&["Secret"]), &roles(&[]));
        assert_eq!(v, doc["Secret"]);
    }

    #[test]
    fn scenario_meta_visibility_combinations() {
        let doc = json!({
            "Thing": {"meta": {"require": {"read_data": ["x"], "read_meta": ["y"]}}, "data": 1}
        });
        let v_x = get(&doc, &path(&["Thing"]), &roles(&["x"]));
        assert_eq!(v_x, json!(1));

        let v_y = get(&doc, &path(&["Thing"]), &roles(&["y"]));
        assert_eq!(v_y["data"], Value::Null);
        assert!(v_y["meta"].is_object());

        let v_xy = get(&doc, &path(&["Thing"]), &roles(&["x", "y"]));
        assert_eq!(v_xy["data"], json!(1));
        assert!(v_xy["meta"].is_object());
    }

    #[test]
    fn p3_no_policy_anywhere_is_admin_like_for_any_nonempty_roles() {
        let doc = json!({"a": {"b": [1, 2, 3]}});
        let v = get(&doc, &path(&[]), &roles(&["anyone"]));
        assert_eq!(v, doc);
    }

    #[test]
    fn p4_monotonicity_of_access() {
        let doc = json!({
            "a": {"meta": {"require": {"read_data": ["x"]}}, "data": 1},
            "b": {"meta": {"require": {"read_data": ["y"]}}, "data": 2}
        });
        let small = get(&doc, &path(&[]), &roles(&["x"]));
        let big = get(&doc, &path(&[]), &roles(&["x", "y"]));
        // every key visible under the smaller role set is visible under the
        // superset, with the same value.
        for (k, v) in small.as_object().unwrap() {
            assert_eq!(big.get(k), Some(v));
        }
        assert!(big.as_object().unwrap().len() >= small.as_object().unwrap().len());
    }

    #[test]
    fn p2_restricted_projection_is_a_structural_subset_of_the_admin_projection() {
        let doc = json!({
            "a": {"meta": {"require": {"read_data": ["x"]}}, "data": {"n": 1, "m": 2}},
            "b": {"data": 3}
        });
        let restricted = get(&doc, &path(&[]), &roles(&["someone_else"]));
        let unredacted = get(&doc, &path(&[]), &RoleSet::new());

        // Every leaf the restricted projection emits must appear at the
        // same path in the unredacted one.
        assert_eq!(restricted["b"], unredacted["b"]);
        assert!(restricted.get("a").is_none() || restricted["a"] == unredacted["a"]);
    }

    #[test]
    fn missing_path_element_is_invalid_and_surfaces_as_null() {
        let doc = json!({"a": 1});
        let v = get(&doc, &path(&["missing"]), &roles(&[]));
        assert_eq!(v, Value::Null);
    }

    #[test]
    fn object_without_read_data_but_with_visible_descendant_is_structurally_visible() {
        let doc = json!({
            "Parent": {
                "meta": {"require": {"read_data": ["admin"]}},
                "data": {
                    "Visible": {"meta": {"allow": {"read_data": ["public"]}}, "data": "x"},
                    "Hidden": "y"
                }
            }
        });
        let v = get(&doc, &path(&["Parent"]), &roles(&["public"]));
        assert_eq!(v, json!({"Visible": "x"}));
    }

    #[test]
    fn allow_write_data_unions_into_read_data() {
        let doc = json!({
            "Thing": {"meta": {"allow": {"write_data": ["editor"]}}, "data": "secret"}
        });
        let v = get(&doc, &path(&["Thing"]), &roles(&["editor"]));
        assert_eq!(v, json!("secret"));
    }

    #[test]
    fn unknown_require_key_is_ignored() {
        let doc = json!({
            "Thing": {"meta": {"require": {"create": ["admin"], "delete": ["admin"]}}, "data": "x"}
        });
        // `create`/`delete` (unsuffixed) are not recognised operation keys;
        // read_data stays at its (empty -> admin-bypass-only) default, so a
        // non-empty role set without read_data granted sees nothing.
        let v = get(&doc, &path(&["Thing"]), &roles(&["admin"]));
        assert_eq!(v, Value::Null);
        let admin = get(&doc, &path(&["Thing"]), &roles(&[]));
        assert_eq!(admin, doc["Thing"]);
    }
}
