//! CLI Output Formatting Module
//! Provides consistent, colorized output for terminal UX

use colored::Colorize;
use serde_json::Value;

use crate::engine::hybrid::PagedResult;

pub struct CliFormatter;

impl CliFormatter {
    /// Print a success message
    pub fn success(message: &str) {
        println!("{} {}", "✓".green().bold(), message);
    }

    /// Print an error message
    pub fn error(message: &str) {
        eprintln!("{} {}", "✗".red().bold(), message);
    }

    /// Print a warning message
    pub fn warning(message: &str) {
        println!("{} {}", "⚠".yellow().bold(), message);
    }

    /// Print a section header
    pub fn header(title: &str) {
        println!("\n{}", title.bright_cyan().bold());
        println!("{}", "─".repeat(title.chars().count()).bright_black());
    }

    /// Print a key-value pair
    pub fn kv(key: &str, value: &str) {
        println!("  {}: {}", key.bright_white().bold(), value);
    }

    /// Print a list item
    pub fn item(text: &str) {
        println!("  {} {}", "•".bright_black(), text);
    }

    /// Print a numbered item
    pub fn numbered_item(num: usize, text: &str) {
        println!("  {}. {}", num.to_string().bright_white().bold(), text);
    }

    /// Print a code block
    pub fn code_block(code: &str, language: &str) {
        println!("\n{}", format!("```{}", language).bright_black());
        for line in code.lines() {
            println!("  {}", line.bright_white());
        }
        println!("{}\n", "```".bright_black());
    }

    /// Print one page of joined entities
    pub fn page(collection: &str, result: &PagedResult) {
        Self::header(&format!("{} ({})", collection, page_summary(result)));
        if result.entities.is_empty() {
            Self::warning("No entities on this page");
            return;
        }
        for (i, entity) in result.entities.iter().enumerate() {
            let number = (result.page.saturating_sub(1)) * result.page_size + i as u64 + 1;
            Self::numbered_item(number as usize, &entity_line(entity));
        }
    }

    /// Print a single entity, or a notice when there is none
    pub fn entity(collection: &str, id: &str, entity: Option<&Value>) {
        match entity {
            Some(entity) => {
                Self::header(&format!("{} {}", collection, id));
                let pretty = serde_json::to_string_pretty(entity).unwrap_or_else(|_| entity.to_string());
                Self::code_block(&pretty, "json");
            }
            None => Self::warning(&format!("{} '{}' not found", collection, id)),
        }
    }
}

/// `page 2/3, 5 total`
pub fn page_summary(result: &PagedResult) -> String {
    format!("page {}/{}, {} total", result.page, result.total_pages.max(1), result.total)
}

/// Compact one-line rendering, id first
pub fn entity_line(entity: &Value) -> String {
    let Some(fields) = entity.as_object() else {
        return entity.to_string();
    };
    let mut parts = Vec::with_capacity(fields.len());
    if let Some(id) = fields.get("id") {
        parts.push(format!("id={}", scalar(id)));
    }
    for (key, value) in fields.iter().filter(|(k, _)| k.as_str() != "id") {
        let rendered = match value {
            Value::Array(items) => format!("[{} item{}]", items.len(), if items.len() == 1 { "" } else { "s" }),
            Value::Object(_) => "{…}".to_string(),
            other => scalar(other),
        };
        parts.push(format!("{}={}", key, rendered));
    }
    parts.join(" ")
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::hybrid::options::Page;
    use serde_json::json;

    #[test]
    fn test_page_summary() {
        let result = PagedResult::new(vec![json!({}), json!({})], 5, Some(Page { number: 2, size: 2 }));
        assert_eq!(page_summary(&result), "page 2/3, 5 total");

        let empty = PagedResult::new(vec![], 0, None);
        assert_eq!(page_summary(&empty), "page 1/1, 0 total");
    }

    #[test]
    fn test_entity_line() {
        let entity = json!({
            "status": "open",
            "id": "7",
            "customer": {"id": "1"},
            "items": [1, 2],
            "total": 12.5
        });
        assert_eq!(entity_line(&entity), "id=7 customer={…} items=[2 items] status=open total=12.5");
        assert_eq!(entity_line(&json!(3)), "3");
    }
}
