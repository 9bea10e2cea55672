//! Dictionary ingestion for the index builder.
//!
//! Canonical dictionaries arrive as a single JSON document in one of three
//! shapes. The shape is detected first from the document's structure and the
//! document is then handed to exactly one handler; a document that fits no
//! shape is rejected instead of being read permissively.
//!
//! | Shape | Example |
//! |---|---|
//! | [`DictionaryShape::IdToNames`] | `{"C001": {"names": ["adalimumab", "Humira"]}}` |
//! | [`DictionaryShape::NameToIds`] | `{"humira": "C001", "tnf": ["P1", "P2"]}` |
//! | [`DictionaryShape::RecordList`] | `[{"cui": "C001", "name": "adalimumab"}]` |

use std::collections::HashSet;

use serde_json::Value;

/// Keys that may carry a record's identifier, in lookup order.
pub const ID_KEYS: [&str; 5] = ["id", "kg_id", "cui", "CUI", "ID"];

/// Keys that may carry names, each a string or a list of strings.
pub const NAME_KEYS: [&str; 6] = ["name", "text", "names", "synonyms", "terms", "aliases"];

/// Structural shape of a dictionary document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DictionaryShape {
    /// Object of id → object with name fields.
    IdToNames,
    /// Object of name → id, or name → list of ids.
    NameToIds,
    /// Array of objects, each with an id and name fields.
    RecordList,
}

impl std::fmt::Display for DictionaryShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DictionaryShape::IdToNames => "id_to_names",
            DictionaryShape::NameToIds => "name_to_ids",
            DictionaryShape::RecordList => "record_list",
        })
    }
}

/// A cleaned `(id, name)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pair {
    pub id: String,
    pub name: String,
}

/// Result of parsing a dictionary, with counts for every stage.
#[derive(Debug, Clone)]
pub struct ParsedDictionary {
    pub shape: DictionaryShape,
    /// Raw `(id, name)` candidates found in the document.
    pub pairs_seen: usize,
    /// Candidates rejected by cleaning (missing id, non-string or blank name).
    pub pairs_dropped: usize,
    /// Usable pairs before deduplication.
    pub pairs_loaded: usize,
    /// Pairs after `(id, lowercased name)` deduplication, in document order.
    pub pairs: Vec<Pair>,
}

/// Work out which handler a document belongs to.
pub fn detect_shape(doc: &Value) -> kglink_core::Result<DictionaryShape> {
    match doc {
        Value::Object(map) if map.is_empty() => Err(shape_error("document is an empty object")),
        Value::Object(map) => {
            let objects = map.values().filter(|v| v.is_object()).count();
            if objects == map.len() {
                return Ok(DictionaryShape::IdToNames);
            }
            if objects == 0 && map.values().all(is_id_or_id_list) {
                return Ok(DictionaryShape::NameToIds);
            }
            let (key, value) = map
                .iter()
                .find(|(_, v)| {
                    (objects > 0 && !v.is_object()) || (objects == 0 && !is_id_or_id_list(v))
                })
                .map_or(("?", "?"), |(k, v)| (k.as_str(), kind(v)));
            Err(shape_error(format!(
                "object mixes value kinds: {objects} of {} values are objects, but `{key}` is {value}",
                map.len()
            )))
        }
        Value::Array(items) if items.is_empty() => Err(shape_error("document is an empty array")),
        Value::Array(items) => match items.iter().position(|v| !v.is_object()) {
            None => Ok(DictionaryShape::RecordList),
            Some(pos) => Err(shape_error(format!(
                "array element {pos} is {}, expected an object",
                kind(&items[pos])
            ))),
        },
        other => Err(shape_error(format!(
            "top-level {} is not a dictionary",
            kind(other)
        ))),
    }
}

/// One side of a raw candidate: dictionary keys and values both carry ids and names.
#[derive(Debug, Clone, Copy)]
enum Field<'a> {
    Key(&'a str),
    Value(&'a Value),
    Missing,
}

/// Parse a dictionary document into deduplicated `(id, name)` pairs.
pub fn parse(doc: &Value) -> kglink_core::Result<ParsedDictionary> {
    let shape = detect_shape(doc)?;

    let mut raw: Vec<(Field<'_>, Field<'_>)> = Vec::new();
    match shape {
        DictionaryShape::IdToNames => id_to_names(doc, &mut raw),
        DictionaryShape::NameToIds => name_to_ids(doc, &mut raw),
        DictionaryShape::RecordList => record_list(doc, &mut raw),
    }

    let pairs_seen = raw.len();
    let cleaned: Vec<Pair> = raw
        .into_iter()
        .filter_map(|(id, name)| clean(id, name))
        .collect();
    let pairs_loaded = cleaned.len();
    let pairs_dropped = pairs_seen - pairs_loaded;

    let mut seen = HashSet::new();
    let pairs: Vec<Pair> = cleaned
        .into_iter()
        .filter(|p| seen.insert((p.id.clone(), p.name.to_lowercase())))
        .collect();

    tracing::info!(
        %shape,
        pairs_seen,
        pairs_dropped,
        pairs_loaded,
        pairs_after_dedup = pairs.len(),
        "parsed dictionary"
    );

    if pairs.is_empty() {
        return Err(shape_error(format!(
            "{shape} document yielded no usable (id, name) pairs ({pairs_dropped} of {pairs_seen} candidates dropped)"
        )));
    }

    Ok(ParsedDictionary {
        shape,
        pairs_seen,
        pairs_dropped,
        pairs_loaded,
        pairs,
    })
}

/// Parse a dictionary from JSON text.
pub fn parse_str(json: &str) -> kglink_core::Result<ParsedDictionary> {
    let doc: Value = serde_json::from_str(json)
        .map_err(|e| shape_error(format!("document is not valid JSON: {e}")))?;
    parse(&doc)
}

/// Parse a dictionary file.
pub fn parse_path(path: &std::path::Path) -> kglink_core::Result<ParsedDictionary> {
    let json = std::fs::read_to_string(path)?;
    parse_str(&json)
}

fn id_to_names<'a>(doc: &'a Value, raw: &mut Vec<(Field<'a>, Field<'a>)>) {
    let Value::Object(map) = doc else { return };
    for (id, entry) in map {
        push_names(Field::Key(id), entry, &NAME_KEYS, raw);
    }
}

fn name_to_ids<'a>(doc: &'a Value, raw: &mut Vec<(Field<'a>, Field<'a>)>) {
    let Value::Object(map) = doc else { return };
    for (name, ids) in map {
        match ids {
            Value::Array(list) => {
                raw.extend(list.iter().map(|id| (Field::Value(id), Field::Key(name))));
            }
            id => raw.push((Field::Value(id), Field::Key(name))),
        }
    }
}

fn record_list<'a>(doc: &'a Value, raw: &mut Vec<(Field<'a>, Field<'a>)>) {
    let Value::Array(items) = doc else { return };
    for record in items {
        let id = ID_KEYS
            .iter()
            .find_map(|k| record.get(*k))
            .map_or(Field::Missing, Field::Value);
        push_names(id, record, &NAME_KEYS, raw);
    }
}

/// Push one candidate per name found under `keys`. A record with no name at
/// all still produces one candidate so that it shows up as dropped.
fn push_names<'a>(
    id: Field<'a>,
    record: &'a Value,
    keys: &[&str],
    raw: &mut Vec<(Field<'a>, Field<'a>)>,
) {
    let before = raw.len();
    for key in keys {
        match record.get(*key) {
            None => {}
            Some(Value::Array(names)) => raw.extend(names.iter().map(|n| (id, Field::Value(n)))),
            Some(name) => raw.push((id, Field::Value(name))),
        }
    }
    if raw.len() == before {
        raw.push((id, Field::Missing));
    }
}

fn clean(id: Field<'_>, name: Field<'_>) -> Option<Pair> {
    let id = match id {
        Field::Key(s) => s.trim().to_string(),
        Field::Value(Value::String(s)) => s.trim().to_string(),
        Field::Value(Value::Number(n)) => n.to_string(),
        _ => return None,
    };
    let name = match name {
        Field::Key(s) => s.trim(),
        Field::Value(Value::String(s)) => s.trim(),
        _ => return None,
    };
    if id.is_empty() || name.is_empty() {
        return None;
    }
    Some(Pair {
        id,
        name: name.to_string(),
    })
}

/// Values a name → id map may hold. Null and boolean ids fit the shape and
/// are dropped during cleaning.
fn is_id_or_id_list(v: &Value) -> bool {
    match v {
        Value::Array(items) => items.iter().all(is_scalar),
        other => is_scalar(other),
    }
}

fn is_scalar(v: &Value) -> bool {
    !v.is_array() && !v.is_object()
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn shape_error(reason: impl Into<String>) -> kglink_core::Error {
    kglink_core::Error::DictionaryShape(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids_and_names(parsed: &ParsedDictionary) -> Vec<(&str, &str)> {
        parsed
            .pairs
            .iter()
            .map(|p| (p.id.as_str(), p.name.as_str()))
            .collect()
    }

    #[test]
    fn test_id_to_names() {
        let parsed = parse_str(r#"{"C001": {"names": ["adalimumab", "Humira"]}}"#).unwrap();
        assert_eq!(parsed.shape, DictionaryShape::IdToNames);
        assert_eq!(
            ids_and_names(&parsed),
            vec![("C001", "adalimumab"), ("C001", "Humira")]
        );
    }

    #[test]
    fn test_id_to_names_collects_every_name_field() {
        let parsed = parse_str(
            r#"{"D1": {"names": "psoriasis", "synonyms": ["plaque psoriasis"], "aliases": "psoriasis vulgaris", "terms": []}}"#,
        )
        .unwrap();
        assert_eq!(
            ids_and_names(&parsed),
            vec![
                ("D1", "psoriasis"),
                ("D1", "plaque psoriasis"),
                ("D1", "psoriasis vulgaris"),
            ]
        );
    }

    #[test]
    fn test_name_to_ids() {
        let parsed = parse_str(r#"{"humira": "C001", "tnf": ["P1", "P2"], "x": 42}"#).unwrap();
        assert_eq!(parsed.shape, DictionaryShape::NameToIds);
        assert_eq!(
            ids_and_names(&parsed),
            vec![("C001", "humira"), ("P1", "tnf"), ("P2", "tnf"), ("42", "x")]
        );
    }

    #[test]
    fn test_record_list_key_spellings() {
        let parsed = parse_str(
            r#"[
                {"cui": "C001", "name": "adalimumab"},
                {"CUI": "C002", "names": ["etanercept", "Enbrel"]},
                {"kg_id": "P001", "text": "CTLA4 protein"},
                {"id": 7, "synonyms": "seven"}
            ]"#,
        )
        .unwrap();
        assert_eq!(parsed.shape, DictionaryShape::RecordList);
        assert_eq!(
            ids_and_names(&parsed),
            vec![
                ("C001", "adalimumab"),
                ("C002", "etanercept"),
                ("C002", "Enbrel"),
                ("P001", "CTLA4 protein"),
                ("7", "seven"),
            ]
        );
    }

    #[test]
    fn test_dedup_by_id_and_lowercased_name_first_wins() {
        let parsed = parse_str(
            r#"[
                {"id": "C001", "name": "Humira"},
                {"id": "C001", "name": "HUMIRA"},
                {"id": "C002", "name": "humira"}
            ]"#,
        )
        .unwrap();
        assert_eq!(parsed.pairs_loaded, 3);
        assert_eq!(
            ids_and_names(&parsed),
            vec![("C001", "Humira"), ("C002", "humira")]
        );
    }

    #[test]
    fn test_cleaning_counts() {
        let parsed = parse_str(
            r#"[
                {"id": " C001 ", "names": [" adalimumab ", "", 5, null]},
                {"name": "orphan"},
                {"id": "C002"}
            ]"#,
        )
        .unwrap();
        assert_eq!(ids_and_names(&parsed), vec![("C001", "adalimumab")]);
        assert_eq!(parsed.pairs_seen, 6);
        assert_eq!(parsed.pairs_dropped, 5);
        assert_eq!(parsed.pairs_loaded, 1);
    }

    #[test]
    fn test_name_to_ids_drops_null_ids() {
        let parsed = parse_str(r#"{"humira": "C001", "orphan": null}"#).unwrap();
        assert_eq!(parsed.shape, DictionaryShape::NameToIds);
        assert_eq!(ids_and_names(&parsed), vec![("C001", "humira")]);
        assert_eq!(parsed.pairs_seen, 2);
        assert_eq!(parsed.pairs_dropped, 1);
        assert_eq!(parsed.pairs_loaded, 1);
    }

    #[test]
    fn test_name_to_ids_drops_unusable_list_members() {
        let parsed =
            parse_str(r#"{"tnf": ["P1", null, true], "enbrel": "C002", "flag": false}"#).unwrap();
        assert_eq!(
            ids_and_names(&parsed),
            vec![("P1", "tnf"), ("C002", "enbrel")]
        );
        assert_eq!(parsed.pairs_dropped, 3);
    }

    #[test]
    fn test_name_to_ids_all_null_is_shape_error() {
        assert!(matches!(
            parse_str(r#"{"a": null, "b": null}"#),
            Err(kglink_core::Error::DictionaryShape(_))
        ));
    }

    #[test]
    fn test_document_order_is_preserved() {
        let parsed = parse_str(r#"{"zeta": "Z1", "alpha": "A1", "mid": "M1"}"#).unwrap();
        let names: Vec<_> = parsed.pairs.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_unrecognized_shapes_fail() {
        for doc in [
            r#""just a string""#,
            "42",
            "{}",
            "[]",
            r#"{"a": {"names": ["x"]}, "b": "C1"}"#,
            r#"[{"id": "C1", "name": "x"}, "loose"]"#,
            r#"{"a": [{"id": "nested"}]}"#,
            "not json",
        ] {
            let err = parse_str(doc).unwrap_err();
            assert!(
                matches!(err, kglink_core::Error::DictionaryShape(_)),
                "{doc} gave {err}"
            );
        }
    }

    #[test]
    fn test_zero_usable_pairs_fails() {
        let err = parse_str(r#"[{"id": "C1", "name": "  "}, {"name": "no id"}]"#).unwrap_err();
        assert!(matches!(err, kglink_core::Error::DictionaryShape(_)));
    }

    #[test]
    fn test_parse_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dict.json");
        std::fs::write(&path, r#"{"C001": {"names": ["adalimumab"]}}"#).unwrap();
        let parsed = parse_path(&path).unwrap();
        assert_eq!(parsed.pairs.len(), 1);
    }
}
