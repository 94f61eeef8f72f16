//! Terminal formatting of guard results.
//!
//! Lines end up on the pushing user's stderr verbatim, ANSI styling included.

use std::time::Duration;

use crossterm::style::Stylize;

use super::secrets::Finding;
use crate::git::ObjectInfo;
use crate::hooks::HookOutput;

fn header(text: &str) -> String {
    text.white().underlined().to_string()
}

fn alarm(text: &str) -> String {
    text.red().bold().to_string()
}

fn relief(text: &str) -> String {
    text.green().bold().to_string()
}

pub(crate) fn singular_or_plural(noun: &str, plural: bool) -> String {
    if plural {
        format!("{noun}s")
    } else {
        noun.to_owned()
    }
}

/// Round `d` for display: up to 1ms untouched, below 1s to milliseconds,
/// below 1min to tenths of a second, otherwise to seconds.
pub fn format_duration(d: Duration) -> String {
    const MS: u128 = 1_000_000;
    let rounded = if d <= Duration::from_millis(1) {
        d.as_nanos()
    } else if d < Duration::from_secs(1) {
        round(d.as_nanos(), MS)
    } else if d < Duration::from_secs(60) {
        round(d.as_nanos(), 100 * MS)
    } else {
        round(d.as_nanos(), 1000 * MS)
    };
    duration_string(rounded)
}

fn round(nanos: u128, multiple: u128) -> u128 {
    (nanos + multiple / 2) / multiple * multiple
}

/// Compact unit notation like `512µs`, `1.5s` or `2m3s`.
fn duration_string(nanos: u128) -> String {
    const US: u128 = 1_000;
    const MS: u128 = 1_000_000;
    const S: u128 = 1_000_000_000;
    match nanos {
        0 => "0s".to_owned(),
        n if n < US => format!("{n}ns"),
        n if n < MS => with_fraction(n, US, "µs"),
        n if n < S => with_fraction(n, MS, "ms"),
        n => {
            let secs = n / S;
            let (h, m, s) = (secs / 3600, secs % 3600 / 60, secs % 60);
            let seconds = with_fraction(s * S + n % S, S, "s");
            if h > 0 {
                format!("{h}h{m}m{seconds}")
            } else if m > 0 {
                format!("{m}m{seconds}")
            } else {
                seconds
            }
        }
    }
}

fn with_fraction(value: u128, unit: u128, suffix: &str) -> String {
    let (whole, rest) = (value / unit, value % unit);
    if rest == 0 {
        return format!("{whole}{suffix}");
    }
    let width = unit.ilog10() as usize;
    let digits = format!("{rest:0width$}");
    format!("{whole}.{}{suffix}", digits.trim_end_matches('0'))
}

pub(crate) fn secret_findings(out: &mut HookOutput, findings: &[Finding], multiple_refs: bool, took: Duration) {
    let count = findings.len();
    if count == 0 {
        out.message(format!("{} in {}", relief("No secrets found"), format_duration(took)));
        out.messages(["", ""]);
        return;
    }

    out.message(header(&format!("Push contains {}:", singular_or_plural("secret", count > 1))));
    out.message("");
    for f in findings {
        let mut title = format!("{} in {}:{}", f.rule_id, f.file, f.start_line);
        if f.start_line != f.end_line {
            title.push_str(&format!("-{}", f.end_line));
        }
        if multiple_refs {
            title.push_str(&format!(" [{}]", f.ref_name));
        }
        out.messages([
            format!("  {title}"),
            format!("      Secret:       {}", f.secret),
            format!("      Commit:       {}", f.commit),
            format!("      Details:      {}", f.description),
            format!("      Fingerprint:  {}", f.fingerprint),
            String::new(),
        ]);
    }
    out.message(format!(
        "{} in {}",
        alarm(&format!("{count} {} found", singular_or_plural("secret", count > 1))),
        format_duration(took)
    ));
    out.messages(["", ""]);
}

pub(crate) fn oversize_files(out: &mut HookOutput, files: &[ObjectInfo], limit: i64) {
    out.message(header("Push contains files exceeding the size limit:"));
    out.message("");
    for file in files {
        out.messages([format!("  {}", file.id), format!("      Size: {}B", file.size), String::new()]);
    }
    let total = files.len();
    out.message(alarm(&format!(
        "{total} {} found exceeding the size limit of {limit}B",
        singular_or_plural("file", total > 1)
    )));
    out.messages(["", ""]);
}

pub(crate) fn codeowners_denial(out: &mut HookOutput, patterns: &[String]) {
    out.message(header("Push is denied by CODEOWNERS rule"));
    for pattern in patterns {
        out.message(format!("  - {pattern}"));
    }
}
