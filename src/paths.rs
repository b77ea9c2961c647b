use serde_json::{Map, Value};

/// One component of a sub-value path: a mapping key or a sequence index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathStep {
    Key(String),
    Index(usize),
}

impl From<&str> for PathStep {
    fn from(key: &str) -> Self {
        PathStep::Key(key.to_owned())
    }
}

impl From<String> for PathStep {
    fn from(key: String) -> Self {
        PathStep::Key(key)
    }
}

impl From<usize> for PathStep {
    fn from(index: usize) -> Self {
        PathStep::Index(index)
    }
}

/// Descend through `value` by `path`, or `None` if any component is absent.
pub(crate) fn get_path<'a>(mut value: &'a Value, path: &[PathStep]) -> Option<&'a Value> {
    for step in path {
        value = match step {
            PathStep::Key(key) => value.get(key.as_str())?,
            PathStep::Index(index) => value.get(*index)?,
        };
    }
    Some(value)
}

/// `get_path` over an optional root, cloning the located sub-value.
pub(crate) fn get_path_owned(root: Option<&Value>, path: &[PathStep]) -> Option<Value> {
    root.and_then(|value| get_path(value, path)).cloned()
}

/// Conventional nested update: apply `f` to the sub-value at `path`,
/// creating missing intermediate mappings on the way down.
///
/// An `Index` step into an existing sequence rewrites the slot in range and
/// appends at exactly the sequence length; an index past the end is an
/// error, never a silent rebuild. Without a sequence present, the step
/// materializes a mapping keyed by the decimal rendering of the index,
/// matching the map-creating convention.
pub(crate) fn update_path<F>(
    root: Option<Value>,
    path: &[PathStep],
    f: F,
) -> Result<Value, String>
where
    F: FnOnce(Option<Value>) -> Value,
{
    let Some((step, rest)) = path.split_first() else {
        return Ok(f(root));
    };

    match step {
        PathStep::Key(key) => update_map_entry(root, key.clone(), rest, f),
        PathStep::Index(index) => match root {
            Some(Value::Array(mut items)) => {
                if *index < items.len() {
                    let slot = std::mem::take(&mut items[*index]);
                    items[*index] = update_path(Some(slot), rest, f)?;
                } else if *index == items.len() {
                    items.push(update_path(None, rest, f)?);
                } else {
                    return Err(format!(
                        "index {index} out of bounds for sequence of length {}",
                        items.len()
                    ));
                }
                Ok(Value::Array(items))
            }
            other => update_map_entry(other, index.to_string(), rest, f),
        },
    }
}

fn update_map_entry<F>(
    root: Option<Value>,
    key: String,
    rest: &[PathStep],
    f: F,
) -> Result<Value, String>
where
    F: FnOnce(Option<Value>) -> Value,
{
    let mut map = match root {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let child = map.remove(&key);
    map.insert(key, update_path(child, rest, f)?);
    Ok(Value::Object(map))
}
