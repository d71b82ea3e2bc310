use serde_json::{Map, Value};

/// Read a value at a dotted path (`"a.b.c"`). Only object traversal is
/// supported; array indexing is not part of the mapping language.
pub fn get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
	let mut current = root;
	for segment in path.split('.') {
		current = current.as_object()?.get(segment)?;
	}
	Some(current)
}

/// Write a value at a dotted path, creating intermediate objects as needed.
/// A non-object intermediate value is replaced by an object.
pub fn set(root: &mut Value, path: &str, value: Value) {
	if !root.is_object() {
		*root = Value::Object(Map::new());
	}

	let segments: Vec<&str> = path.split('.').collect();
	let mut current = root;
	for (i, segment) in segments.iter().enumerate() {
		let map = current.as_object_mut().expect("intermediate is an object");
		if i == segments.len() - 1 {
			map.insert((*segment).to_string(), value);
			return;
		}
		let next = map
			.entry((*segment).to_string())
			.or_insert_with(|| Value::Object(Map::new()));
		if !next.is_object() {
			*next = Value::Object(Map::new());
		}
		current = next;
	}
}

/// Remove the value at a dotted path, returning it if present. Intermediate
/// objects are left in place even when emptied.
pub fn remove(root: &mut Value, path: &str) -> Option<Value> {
	let (parent_path, leaf) = path.rsplit_once('.').unwrap_or(("", path));
	let parent = if parent_path.is_empty() {
		root
	} else {
		get_mut(root, parent_path)?
	};
	parent.as_object_mut()?.remove(leaf)
}

fn get_mut<'a>(root: &'a mut Value, path: &str) -> Option<&'a mut Value> {
	let mut current = root;
	for segment in path.split('.') {
		current = current.as_object_mut()?.get_mut(segment)?;
	}
	Some(current)
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn get_nested() {
		let value = json!({"a": {"b": {"c": 7}}});
		assert_eq!(get(&value, "a.b.c"), Some(&json!(7)));
		assert_eq!(get(&value, "a.b"), Some(&json!({"c": 7})));
		assert_eq!(get(&value, "a.x.c"), None);
	}

	#[test]
	fn set_creates_intermediate_objects() {
		let mut value = json!({});
		set(&mut value, "meta.owner.name", json!("dana"));
		assert_eq!(value, json!({"meta": {"owner": {"name": "dana"}}}));
	}

	#[test]
	fn set_replaces_non_object_intermediate() {
		let mut value = json!({"meta": 3});
		set(&mut value, "meta.owner", json!("dana"));
		assert_eq!(value, json!({"meta": {"owner": "dana"}}));
	}

	#[test]
	fn remove_leaf() {
		let mut value = json!({"a": {"b": 1, "c": 2}});
		assert_eq!(remove(&mut value, "a.b"), Some(json!(1)));
		assert_eq!(value, json!({"a": {"c": 2}}));
		assert_eq!(remove(&mut value, "a.missing"), None);
	}

	#[test]
	fn remove_top_level() {
		let mut value = json!({"x": 1});
		assert_eq!(remove(&mut value, "x"), Some(json!(1)));
		assert_eq!(value, json!({}));
	}
}
