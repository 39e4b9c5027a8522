//! Comment trees and the repair of `/api/morechildren` results.
//!
//! Every comment endpoint nests replies under `replies`, except
//! `/api/morechildren`, which returns the revealed comments as one flat list
//! ordered parent-before-child. [`build_tree`] restores the nesting so callers
//! only ever see one shape.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};

pub const KIND_COMMENT: &str = "t1";
pub const KIND_MORE: &str = "more";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thing {
    pub kind: String,
    pub data: CommentNode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentNode {
    pub name: String,
    pub parent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub replies: Replies,
    /// Everything else reddit sent (author, score, `children` of a "more"
    /// stub, ...), carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The `replies` field. Reddit sends `""` when no replies were loaded and a
/// `Listing` otherwise.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Replies {
    #[default]
    NotLoaded,
    Loaded(Vec<Thing>),
}

impl Replies {
    pub fn children(&self) -> &[Thing] {
        match self {
            Replies::NotLoaded => &[],
            Replies::Loaded(children) => children,
        }
    }

    /// Appends `children`, replacing the `""` placeholder with a listing.
    pub fn extend(&mut self, children: Vec<Thing>) {
        match self {
            Replies::Loaded(existing) => existing.extend(children),
            Replies::NotLoaded => *self = Replies::Loaded(children),
        }
    }
}

impl Serialize for Replies {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Replies::NotLoaded => serializer.serialize_str(""),
            Replies::Loaded(children) => json!({
                "kind": "Listing",
                "data": { "children": children },
            })
            .serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Replies {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct ListingHelper {
            data: ListingData,
        }

        #[derive(Deserialize)]
        struct ListingData {
            #[serde(default)]
            children: Vec<Thing>,
        }

        let raw = Value::deserialize(deserializer)?;
        match raw {
            Value::Null => Ok(Replies::NotLoaded),
            Value::String(s) if s.is_empty() => Ok(Replies::NotLoaded),
            Value::Object(_) => {
                let listing: ListingHelper =
                    serde_json::from_value(raw).map_err(D::Error::custom)?;
                Ok(Replies::Loaded(listing.data.children))
            }
            other => Err(D::Error::custom(format!(
                "replies must be \"\" or a listing, got {}",
                other
            ))),
        }
    }
}

impl Thing {
    pub fn is_more(&self) -> bool {
        self.kind == KIND_MORE
    }

    /// Comment ids a "more" stub stands for.
    pub fn more_children(&self) -> Vec<String> {
        self.data
            .extra
            .get("children")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Deserialize)]
struct MoreChildrenResponse {
    json: MoreChildrenBody,
}

#[derive(Deserialize)]
struct MoreChildrenBody {
    #[serde(default)]
    errors: Vec<Value>,
    data: MoreChildrenData,
}

#[derive(Deserialize)]
struct MoreChildrenData {
    things: Vec<Thing>,
}

/// Pulls the flat comment list out of a `/api/morechildren?api_type=json`
/// response.
pub fn decode_more_children(value: Value) -> Result<Vec<Thing>, String> {
    let resp: MoreChildrenResponse =
        serde_json::from_value(value).map_err(|err| format!("morechildren: {}", err))?;
    if let Some(first) = resp.json.errors.first() {
        return Err(format!("morechildren error: {}", first));
    }
    Ok(resp.json.data.things)
}

/// Nests a flat, parent-before-child comment list.
///
/// A stack of open ancestors is kept, with the empty stack acting as the
/// root-level sentinel. Each comment pops ancestors until it finds its parent
/// on top, or becomes a root when the stack runs out. Comments whose parent
/// is not an open ancestor therefore land at root level (or as a sibling of
/// an uncle when the input is out of order); the input is never rejected.
pub fn build_tree(flat: Vec<Thing>) -> Vec<Thing> {
    let mut kids: Vec<Vec<usize>> = vec![Vec::new(); flat.len()];
    let mut roots = Vec::new();
    let mut stack: Vec<usize> = Vec::new();

    for (idx, thing) in flat.iter().enumerate() {
        loop {
            match stack.last() {
                None => {
                    roots.push(idx);
                    stack.push(idx);
                    break;
                }
                Some(&top) if flat[top].data.name == thing.data.parent_id => {
                    kids[top].push(idx);
                    stack.push(idx);
                    break;
                }
                Some(_) => {
                    stack.pop();
                }
            }
        }
    }

    // Children always sit after their parent in `flat`, so walking backwards
    // finishes every subtree before its parent needs it.
    let mut slots: Vec<Option<Thing>> = flat.into_iter().map(Some).collect();
    for idx in (0..slots.len()).rev() {
        if kids[idx].is_empty() {
            continue;
        }
        let children: Vec<Thing> = kids[idx]
            .iter()
            .filter_map(|&child| slots[child].take())
            .collect();
        if let Some(parent) = slots[idx].as_mut() {
            parent.data.replies.extend(children);
        }
    }

    roots
        .into_iter()
        .filter_map(|idx| slots[idx].take())
        .collect()
}

/// Replaces the "more" stub named `more_name` anywhere in `tree` with
/// `replacement`. Returns whether the stub was found.
pub fn splice_more(tree: &mut Vec<Thing>, more_name: &str, replacement: Vec<Thing>) -> bool {
    let mut replacement = Some(replacement);
    splice_inner(tree, more_name, &mut replacement)
}

fn splice_inner(
    tree: &mut Vec<Thing>,
    more_name: &str,
    replacement: &mut Option<Vec<Thing>>,
) -> bool {
    if let Some(pos) = tree
        .iter()
        .position(|thing| thing.is_more() && thing.data.name == more_name)
    {
        let new = replacement.take().unwrap_or_default();
        tree.splice(pos..=pos, new);
        return true;
    }
    for thing in tree.iter_mut() {
        if let Replies::Loaded(children) = &mut thing.data.replies {
            if splice_inner(children, more_name, replacement) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment(name: &str, parent: &str) -> Thing {
        serde_json::from_value(json!({
            "kind": "t1",
            "data": {
                "name": name,
                "parent_id": parent,
                "body": format!("body of {}", name),
                "replies": "",
            }
        }))
        .unwrap()
    }

    fn names(things: &[Thing]) -> Vec<&str> {
        things.iter().map(|t| t.data.name.as_str()).collect()
    }

    #[test]
    fn flat_list_becomes_nested() {
        let roots = build_tree(vec![
            comment("t1_a", "t3_link"),
            comment("t1_b", "t1_a"),
            comment("t1_c", "t3_link"),
        ]);
        assert_eq!(names(&roots), vec!["t1_a", "t1_c"]);
        assert_eq!(names(roots[0].data.replies.children()), vec!["t1_b"]);
        assert!(roots[1].data.replies.children().is_empty());
    }

    #[test]
    fn empty_string_replies_become_listing() {
        let roots = build_tree(vec![comment("t1_a", "t3_x"), comment("t1_b", "t1_a")]);
        let parent = &roots[0];
        assert!(matches!(parent.data.replies, Replies::Loaded(ref kids) if kids.len() == 1));

        let wire = serde_json::to_value(parent).unwrap();
        assert!(wire["data"]["replies"].is_object());
        assert_eq!(
            wire["data"]["replies"]["data"]["children"][0]["data"]["name"],
            "t1_b"
        );
        // Leaves keep the reddit placeholder.
        assert_eq!(
            wire["data"]["replies"]["data"]["children"][0]["data"]["replies"],
            ""
        );
    }

    #[test]
    fn deep_chain_then_back_to_root() {
        let roots = build_tree(vec![
            comment("t1_a", "t3_x"),
            comment("t1_b", "t1_a"),
            comment("t1_c", "t1_b"),
            comment("t1_d", "t1_a"),
            comment("t1_e", "t3_x"),
        ]);
        assert_eq!(names(&roots), vec!["t1_a", "t1_e"]);
        let a = &roots[0].data.replies;
        assert_eq!(names(a.children()), vec!["t1_b", "t1_d"]);
        assert_eq!(names(a.children()[0].data.replies.children()), vec!["t1_c"]);
    }

    #[test]
    fn existing_replies_are_extended() {
        let mut parent = comment("t1_a", "t3_x");
        parent.data.replies = Replies::Loaded(vec![comment("t1_old", "t1_a")]);
        let roots = build_tree(vec![parent, comment("t1_new", "t1_a")]);
        assert_eq!(
            names(roots[0].data.replies.children()),
            vec!["t1_old", "t1_new"]
        );
    }

    #[test]
    fn unknown_parents_become_roots_in_order() {
        let roots = build_tree(vec![
            comment("t1_a", "t1_missing"),
            comment("t1_b", "t1_gone"),
        ]);
        assert_eq!(names(&roots), vec!["t1_a", "t1_b"]);
    }

    #[test]
    fn extend_replaces_placeholder() {
        let mut replies = Replies::NotLoaded;
        replies.extend(vec![comment("t1_a", "t3_x")]);
        replies.extend(vec![comment("t1_b", "t3_x")]);
        assert_eq!(names(replies.children()), vec!["t1_a", "t1_b"]);

        let mut empty = Replies::NotLoaded;
        empty.extend(Vec::new());
        assert_eq!(empty, Replies::Loaded(Vec::new()));
    }

    #[test]
    fn empty_input() {
        assert!(build_tree(Vec::new()).is_empty());
    }

    #[test]
    fn decode_rejects_missing_things() {
        assert!(decode_more_children(json!({"json": {"data": {}}})).is_err());
        assert!(decode_more_children(json!({"json": {"errors": [["RATELIMIT"]], "data": {"things": []}}})).is_err());

        let things = decode_more_children(json!({
            "json": {"errors": [], "data": {"things": [
                {"kind": "t1", "data": {"name": "t1_a", "parent_id": "t3_x", "body": "hi", "replies": ""}}
            ]}}
        }))
        .unwrap();
        assert_eq!(names(&things), vec!["t1_a"]);
    }

    #[test]
    fn decode_rejects_comment_without_name() {
        let result = decode_more_children(json!({
            "json": {"data": {"things": [{"kind": "t1", "data": {"parent_id": "t3_x"}}]}}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn splice_replaces_nested_more_stub() {
        let more: Thing = serde_json::from_value(json!({
            "kind": "more",
            "data": {"name": "t1_more", "parent_id": "t1_a", "count": 2, "children": ["b", "c"]}
        }))
        .unwrap();
        assert_eq!(more.more_children(), vec!["b", "c"]);

        let mut root = comment("t1_a", "t3_x");
        root.data.replies = Replies::Loaded(vec![comment("t1_z", "t1_a"), more]);
        let mut tree = vec![root];

        let found = splice_more(
            &mut tree,
            "t1_more",
            vec![comment("t1_b", "t1_a"), comment("t1_c", "t1_a")],
        );
        assert!(found);
        assert_eq!(
            names(tree[0].data.replies.children()),
            vec!["t1_z", "t1_b", "t1_c"]
        );
        assert!(!splice_more(&mut tree, "t1_more", Vec::new()));
    }
}
