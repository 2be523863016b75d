//! Item list input.

use std::path::Path;

use tracing::debug;

use pricewatch_shared::{Item, PricewatchError, Result};

/// Read an item list from a JSON array file.
///
/// Each entry needs a `key` (also accepted as `ean`/`sku`); `code`
/// (`codigo`) and `description` (`descripcion`) are optional. Keys are
/// trimmed; numeric keys are accepted and kept as written.
pub fn load_items(path: &Path) -> Result<Vec<Item>> {
    let content = std::fs::read_to_string(path).map_err(|e| PricewatchError::io(path, e))?;
    let items = parse_items(&content)?;
    debug!(path = %path.display(), count = items.len(), "items loaded");
    Ok(items)
}

/// Parse an item list from JSON text.
pub fn parse_items(content: &str) -> Result<Vec<Item>> {
    let raw: Vec<serde_json::Value> = serde_json::from_str(content)
        .map_err(|e| PricewatchError::validation(format!("invalid item list: {e}")))?;

    raw.into_iter()
        .enumerate()
        .map(|(i, mut value)| {
            // Spreadsheet exports often carry EANs as numbers.
            if let Some(obj) = value.as_object_mut() {
                for field in ["key", "ean", "sku", "SKU", "code", "codigo"] {
                    if let Some(n) = obj.get(field).filter(|v| v.is_number()).cloned() {
                        obj.insert(field.to_string(), serde_json::Value::String(n.to_string()));
                    }
                }
            }
            let item: Item = serde_json::from_value(value).map_err(|e| {
                PricewatchError::validation(format!("item {}: {e}", i + 1))
            })?;
            Ok(Item::new(item.key, item.code.trim(), item.description.trim()))
        })
        .collect()
}
