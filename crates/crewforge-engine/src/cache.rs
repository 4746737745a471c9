use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

/// Memoized tool results for one crew run.
///
/// Keys are the tool name plus the canonical JSON form of the input, with
/// object keys sorted at every depth, so `{"a":1,"b":2}` and `{"b":2,"a":1}`
/// share an entry.
#[derive(Default)]
pub struct CacheHandler {
    entries: Mutex<HashMap<(String, String), Value>>,
}

impl CacheHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(tool: &str, input: &Value) -> (String, String) {
        let mut canonical = String::new();
        write_canonical(input, &mut canonical);
        (tool.to_string(), canonical)
    }

    pub fn read(&self, tool: &str, input: &Value) -> Option<Value> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(&Self::key(tool, input)).cloned()
    }

    pub fn add(&self, tool: &str, input: &Value, output: Value) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(Self::key(tool, input), output);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
