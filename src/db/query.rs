//! Filter, update and projection evaluation for the in-memory store
//!
//! Supports the subset of the MongoDB query language the pipeline
//! issues: equality (with array membership), `$eq`, `$ne`, `$in`, `$nin`,
//! `$exists`, `$gt`, `$gte`, `$lt`, `$lte`, `$and`, `$or` in filters and
//! `$set`, `$setOnInsert`, `$unset`, `$addToSet` (with `$each`) and `$pull`
//! in updates. Dotted paths address embedded documents.

use std::cmp::Ordering;

use bson::{Bson, Document};

use crate::types::{MirrorError, Result};

/// Whether `doc` satisfies `filter`
pub fn matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, cond)| match key.as_str() {
        "$and" => sub_filters(cond).all(|f| matches(doc, f)),
        "$or" => sub_filters(cond).any(|f| matches(doc, f)),
        _ => field_matches(lookup(doc, key), cond),
    })
}

fn sub_filters(cond: &Bson) -> impl Iterator<Item = &Document> {
    let items: &[Bson] = match cond {
        Bson::Array(items) => items,
        _ => &[],
    };
    items.iter().filter_map(|item| item.as_document())
}

fn is_operator_doc(cond: &Bson) -> Option<&Document> {
    match cond {
        Bson::Document(ops) if ops.keys().next().is_some_and(|k| k.starts_with('$')) => Some(ops),
        _ => None,
    }
}

fn field_matches(value: Option<&Bson>, cond: &Bson) -> bool {
    match is_operator_doc(cond) {
        Some(ops) => ops
            .iter()
            .all(|(op, arg)| operator_matches(value, op, arg)),
        None => equals_or_contains(value, cond),
    }
}

fn equals_or_contains(value: Option<&Bson>, expected: &Bson) -> bool {
    match value {
        Some(Bson::Array(items)) if !matches!(expected, Bson::Array(_)) => {
            items.iter().any(|item| values_equal(item, expected))
        }
        Some(v) => values_equal(v, expected),
        None => matches!(expected, Bson::Null),
    }
}

fn operator_matches(value: Option<&Bson>, op: &str, arg: &Bson) -> bool {
    match op {
        "$eq" => equals_or_contains(value, arg),
        "$ne" => !equals_or_contains(value, arg),
        "$in" => as_slice(arg).iter().any(|a| equals_or_contains(value, a)),
        "$nin" => !as_slice(arg).iter().any(|a| equals_or_contains(value, a)),
        "$exists" => value.is_some() == truthy(arg),
        "$gt" | "$gte" | "$lt" | "$lte" => value
            .and_then(|v| compare(v, arg))
            .is_some_and(|ord| match op {
                "$gt" => ord == Ordering::Greater,
                "$gte" => ord != Ordering::Less,
                "$lt" => ord == Ordering::Less,
                _ => ord != Ordering::Greater,
            }),
        _ => false,
    }
}

fn as_slice(arg: &Bson) -> &[Bson] {
    match arg {
        Bson::Array(items) => items,
        _ => &[],
    }
}

fn truthy(arg: &Bson) -> bool {
    match arg {
        Bson::Boolean(b) => *b,
        Bson::Int32(v) => *v != 0,
        Bson::Int64(v) => *v != 0,
        Bson::Double(v) => *v != 0.0,
        Bson::Null => false,
        _ => true,
    }
}

fn as_number(v: &Bson) -> Option<f64> {
    match v {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

/// Equality with numeric widening
pub fn values_equal(a: &Bson, b: &Bson) -> bool {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Ordering between comparable values of the same kind
pub fn compare(a: &Bson, b: &Bson) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.cmp(y)),
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => Some(x.bytes().cmp(&y.bytes())),
        _ => None,
    }
}

/// Resolve a dotted path
pub fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let first = doc.get(parts.next()?)?;
    parts.try_fold(first, |current, part| match current {
        Bson::Document(child) => child.get(part),
        _ => None,
    })
}

/// Set a dotted path, creating intermediate documents
pub fn set_path(doc: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Bson::Document(_))) {
                doc.insert(head, Document::new());
            }
            if let Some(Bson::Document(child)) = doc.get_mut(head) {
                set_path(child, rest, value);
            }
        }
    }
}

fn remove_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(child)) = doc.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

fn array_at<'a>(doc: &'a mut Document, path: &str) -> Result<&'a mut Vec<Bson>> {
    if matches!(lookup(doc, path), None | Some(Bson::Null)) {
        set_path(doc, path, Bson::Array(Vec::new()));
    }
    let (parent, leaf) = match path.rsplit_once('.') {
        Some((parent_path, leaf)) => (parent_mut(doc, parent_path)?, leaf),
        None => (doc, path),
    };
    match parent.get_mut(leaf) {
        Some(Bson::Array(items)) => Ok(items),
        _ => Err(MirrorError::Database(format!(
            "field '{}' is not an array",
            path
        ))),
    }
}

fn parent_mut<'a>(doc: &'a mut Document, path: &str) -> Result<&'a mut Document> {
    path.split('.').try_fold(doc, |current, part| match current.get_mut(part) {
        Some(Bson::Document(child)) => Ok(child),
        _ => Err(MirrorError::Database(format!(
            "path '{}' is not a document",
            path
        ))),
    })
}

fn each_values(value: &Bson) -> Vec<Bson> {
    match value {
        Bson::Document(d) if d.contains_key("$each") => match d.get("$each") {
            Some(Bson::Array(items)) => items.clone(),
            _ => Vec::new(),
        },
        other => vec![other.clone()],
    }
}

/// Apply an update document in place, returning whether anything changed
pub fn apply_update(doc: &mut Document, update: &Document, inserting: bool) -> Result<bool> {
    let before = doc.clone();

    for (op, fields) in update {
        let fields = fields.as_document().ok_or_else(|| {
            MirrorError::Database(format!("update operator {} expects a document", op))
        })?;

        match op.as_str() {
            "$set" => {
                for (path, value) in fields {
                    set_path(doc, path, value.clone());
                }
            }
            "$setOnInsert" => {
                if inserting {
                    for (path, value) in fields {
                        set_path(doc, path, value.clone());
                    }
                }
            }
            "$unset" => {
                for (path, _) in fields {
                    remove_path(doc, path);
                }
            }
            "$addToSet" => {
                for (path, value) in fields {
                    let items = array_at(doc, path)?;
                    for candidate in each_values(value) {
                        if !items.iter().any(|existing| values_equal(existing, &candidate)) {
                            items.push(candidate);
                        }
                    }
                }
            }
            "$pull" => {
                for (path, value) in fields {
                    let present = matches!(lookup(doc, path), Some(Bson::Array(_)));
                    if present {
                        let items = array_at(doc, path)?;
                        items.retain(|existing| !equals_or_contains(Some(existing), value));
                    }
                }
            }
            other => {
                return Err(MirrorError::Database(format!(
                    "unsupported update operator {}",
                    other
                )))
            }
        }
    }

    Ok(*doc != before)
}

/// Seed document for an upsert: the plain equality fields of the filter
pub fn upsert_seed(filter: &Document) -> Document {
    let mut seed = Document::new();
    for (key, value) in filter {
        if key.starts_with('$') || is_operator_doc(value).is_some() {
            continue;
        }
        set_path(&mut seed, key, value.clone());
    }
    seed
}

/// Apply a projection document
pub fn project(doc: &Document, projection: &Document) -> Document {
    let inclusive = projection.values().any(truthy);

    if inclusive {
        let mut out = Document::new();
        let keep_id = projection.get("_id").map(truthy).unwrap_or(true);
        if keep_id {
            if let Some(id) = doc.get("_id") {
                out.insert("_id", id.clone());
            }
        }
        for (path, flag) in projection {
            if path == "_id" || !truthy(flag) {
                continue;
            }
            if let Some(value) = lookup(doc, path) {
                set_path(&mut out, path, value.clone());
            }
        }
        out
    } else {
        let mut out = doc.clone();
        for (path, flag) in projection {
            if !truthy(flag) {
                remove_path(&mut out, path);
            }
        }
        out
    }
}

/// Sort documents by a sort specification (`1` ascending, `-1` descending)
pub fn sort_docs(docs: &mut [Document], sort: &Document) {
    docs.sort_by(|a, b| {
        for (path, direction) in sort {
            let ord = match (lookup(a, path), lookup(b, path)) {
                (Some(x), Some(y)) => compare(x, y).unwrap_or(Ordering::Equal),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            let ord = if as_number(direction).unwrap_or(1.0) < 0.0 {
                ord.reverse()
            } else {
                ord
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_equality_matches_array_members() {
        let d = doc! { "_id": 1_i64, "votes": [3_i64, 4_i64] };
        assert!(matches(&d, &doc! { "votes": 4_i64 }));
        assert!(!matches(&d, &doc! { "votes": 5_i64 }));
    }

    #[test]
    fn test_in_and_numeric_widening() {
        let d = doc! { "_id": 7_i64 };
        assert!(matches(&d, &doc! { "_id": { "$in": [1_i32, 7_i32] } }));
        assert!(matches(&d, &doc! { "_id": { "$gt": 6_i64, "$lte": 7_i64 } }));
    }

    #[test]
    fn test_or_and_exists() {
        let d = doc! { "name": "alice" };
        assert!(matches(
            &d,
            &doc! { "$or": [ { "name": "bob" }, { "name": "alice" } ] }
        ));
        assert!(matches(&d, &doc! { "author": { "$exists": false } }));
    }

    #[test]
    fn test_add_to_set_is_idempotent() {
        let mut d = doc! { "_id": 1_i64 };
        let update = doc! { "$addToSet": { "votes": 9_i64 } };
        assert!(apply_update(&mut d, &update, false).unwrap());
        assert!(!apply_update(&mut d, &update, false).unwrap());
        assert_eq!(d.get_array("votes").unwrap().len(), 1);
    }

    #[test]
    fn test_pull_and_unset() {
        let mut d = doc! { "votes": [1_i64, 2_i64], "analyze": true };
        apply_update(
            &mut d,
            &doc! { "$pull": { "votes": 1_i64 }, "$unset": { "analyze": "" } },
            false,
        )
        .unwrap();
        assert_eq!(d.get_array("votes").unwrap(), &vec![Bson::Int64(2)]);
        assert!(!d.contains_key("analyze"));
    }

    #[test]
    fn test_dotted_set_and_project() {
        let mut d = doc! { "_id": 1_i64, "raw": { "author": "a" } };
        apply_update(&mut d, &doc! { "$set": { "raw.json_metadata.tags": ["x"] } }, false)
            .unwrap();
        let p = project(&d, &doc! { "raw.author": 1 });
        assert_eq!(p, doc! { "_id": 1_i64, "raw": { "author": "a" } });
        assert_eq!(project(&d, &doc! { "_id": 1 }), doc! { "_id": 1_i64 });
        assert_eq!(project(&d, &doc! { "raw": 0 }), doc! { "_id": 1_i64 });
    }

    #[test]
    fn test_upsert_seed_skips_operators() {
        let seed = upsert_seed(&doc! { "tag": "x", "current_num": { "$lt": 5 } });
        assert_eq!(seed, doc! { "tag": "x" });
    }
}
