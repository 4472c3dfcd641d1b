//! Page shown in the main window when the server could not be brought up.

use std::error::Error as _;
use std::fmt::Write as _;
use std::path::Path;

use crate::error::{SupervisorError, SupervisorErrorKind};

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

pub fn diagnostic_page(err: &SupervisorError, log_path: Option<&Path>) -> String {
    let mut body = String::new();
    let _ = write!(
        body,
        "<h1>DDT Manager could not start its server</h1><p>Failed while {}.</p>",
        escape_html(&err.state.to_string())
    );

    let _ = write!(body, "<h2>Error</h2><ul>");
    let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(current) = cause {
        let _ = write!(body, "<li>{}</li>", escape_html(&current.to_string()));
        cause = current.source();
    }
    body.push_str("</ul>");

    if let SupervisorErrorKind::Provision(provision) = &err.kind {
        if let Some(command) = provision.command() {
            let _ = write!(
                body,
                "<h2>Command</h2><pre>{}</pre>",
                escape_html(command)
            );
        }
        if !provision.output().trim().is_empty() {
            let _ = write!(
                body,
                "<h2>Output</h2><pre>{}</pre>",
                escape_html(provision.output())
            );
        }
    }
    if let SupervisorErrorKind::ExitedEarly { stderr_tail, .. } = &err.kind {
        if !stderr_tail.trim().is_empty() {
            let _ = write!(
                body,
                "<h2>Server output</h2><pre>{}</pre>",
                escape_html(stderr_tail)
            );
        }
    }
    if let Some(path) = log_path {
        let _ = write!(
            body,
            "<p>Full logs: <code>{}</code></p>",
            escape_html(&path.display().to_string())
        );
    }

    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>DDT Manager</title>\
         <style>body{{font-family:sans-serif;margin:2em;color:#222}}\
         pre{{background:#f4f4f4;padding:1em;overflow:auto;white-space:pre-wrap}}</style>\
         </head><body>{body}</body></html>"
    )
}
