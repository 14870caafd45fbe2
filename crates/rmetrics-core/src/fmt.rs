//! Shared formatting helpers: byte sizes for logs and the HTML metrics report.

use std::fmt::Write;

use crate::model::MetricSet;

/// Format byte count as human-readable size: `"1.5G"`, `"100.3M"`, `"50.0K"`, `"512B"`.
pub fn format_bytes(bytes: u64) -> String {
    const GB: u64 = 1024 * 1024 * 1024;
    const MB: u64 = 1024 * 1024;
    const KB: u64 = 1024;

    let f = bytes as f64;
    if bytes >= GB {
        format!("{:.1}G", f / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}M", f / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}K", f / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Escape text for inclusion in HTML element content.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Renders the human-readable listing served at `GET /`.
///
/// Gauges and counters are listed in separate tables, each sorted by name.
pub fn render_report(set: &MetricSet) -> String {
    let mut html = String::from(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>Metrics</title></head>\n<body>\n",
    );
    let _ = writeln!(html, "<h1>Metrics ({})</h1>", set.len());

    html.push_str("<h2>Gauges</h2>\n<table border=\"1\">\n<tr><th>Name</th><th>Value</th></tr>\n");
    for (name, value) in &set.gauges {
        let _ = writeln!(
            html,
            "<tr><td>{}</td><td>{}</td></tr>",
            escape_html(name),
            value
        );
    }
    html.push_str("</table>\n");

    html.push_str("<h2>Counters</h2>\n<table border=\"1\">\n<tr><th>Name</th><th>Value</th></tr>\n");
    for (name, value) in &set.counters {
        let _ = writeln!(
            html,
            "<tr><td>{}</td><td>{}</td></tr>",
            escape_html(name),
            value
        );
    }
    html.push_str("</table>\n</body>\n</html>\n");
    html
}
