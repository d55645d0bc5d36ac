//! Config-value schema — a typed descriptor table drives parse and format.
//!
//! Each configurable option is one [`ConfigDescriptor`] in a static table.
//! Instead of pointer-plus-offset binding, every descriptor carries typed
//! getter/setter functions over the target struct; optional subsystems are
//! `Option` fields whose setters silently discard the value while the
//! subsystem is absent.
//!
//! Parsing a `name = value` line:
//! 1. locate the descriptor under the active section (named sections are
//!    opaque to the default section and vice versa),
//! 2. for numerics, split a trailing unit token and scale,
//! 3. range-check after scaling,
//! 4. for `set`, OR each comma/whitespace token's bit into the target,
//! 5. for `special`, call the parse callback with a scratch error buffer,
//! 6. deprecated options warn once per option per run, naming the
//!    replacement.
//!
//! Formatting picks the largest unit that divides the value evenly, prints
//! booleans as `yes`/`no`, joins set bits with commas, and yields
//! multi-line `special` output through a line iterator.

use std::collections::HashSet;

use log::warn;

use crate::errors::{Error, Result};

/// Binary byte units for scaled numeric options.
pub const BYTE_UNITS: &[(&str, i64)] = &[
    ("T", 1 << 40),
    ("G", 1 << 30),
    ("M", 1 << 20),
    ("K", 1 << 10),
];

/// Time units in seconds.
pub const TIME_UNITS: &[(&str, i64)] = &[("d", 86_400), ("h", 3600), ("m", 60), ("s", 1)];

// ── Descriptor table ─────────────────────────────────────────────────────────

/// Parse callback of a `special` descriptor: returns false and fills the
/// scratch buffer on failure.
pub type SpecialParse<T> = fn(&mut T, &str, &mut String) -> bool;
/// Format callback of a `special` descriptor: one string per output line.
pub type SpecialFormat<T> = fn(&T) -> Vec<String>;

pub enum ValueKind<T> {
    Integer {
        set: fn(&mut T, i64),
        get: fn(&T) -> i64,
        min: i64,
        max: i64,
        units: &'static [(&'static str, i64)],
    },
    Int64 {
        set: fn(&mut T, i64),
        get: fn(&T) -> i64,
        min: i64,
        max: i64,
        units: &'static [(&'static str, i64)],
    },
    Double {
        set: fn(&mut T, f64),
        get: fn(&T) -> f64,
        min: f64,
        max: f64,
    },
    Bool {
        set: fn(&mut T, bool),
        get: fn(&T) -> bool,
    },
    /// Assigns a fixed value when the option appears; the input text is
    /// not interpreted.
    Enum {
        set: fn(&mut T, i64),
        value: i64,
    },
    Select {
        set: fn(&mut T, i64),
        get: fn(&T) -> i64,
        table: &'static [(&'static str, i64)],
    },
    /// The setter ORs the parsed mask into the target.
    Set {
        set: fn(&mut T, u64),
        get: fn(&T) -> u64,
        table: &'static [(&'static str, u64)],
    },
    String {
        set: fn(&mut T, String),
        get: fn(&T) -> String,
    },
    Special {
        parse: SpecialParse<T>,
        format: Option<SpecialFormat<T>>,
    },
    Comment(&'static str),
    BeginSection,
    EndSection,
    Deprecated {
        replacement: Option<&'static str>,
    },
}

pub struct ConfigDescriptor<T> {
    pub name: &'static str,
    pub kind: ValueKind<T>,
}

/// Once-per-option-per-run suppression of deprecation warnings.
#[derive(Default)]
pub struct DeprecationWarnings {
    warned: HashSet<&'static str>,
}

// ── Lookup ───────────────────────────────────────────────────────────────────

/// Find a descriptor by name under the given section.
///
/// With no active section, descriptors inside any `[section]` are skipped;
/// with an active section only its descriptors match.
fn find<'t, T>(
    table: &'t [ConfigDescriptor<T>],
    section: Option<&str>,
    name: &str,
) -> Option<&'t ConfigDescriptor<T>> {
    let mut inside: Option<&str> = None;
    for descriptor in table {
        match &descriptor.kind {
            ValueKind::BeginSection => {
                inside = Some(descriptor.name);
                continue;
            }
            ValueKind::EndSection => {
                inside = None;
                continue;
            }
            ValueKind::Comment(_) => continue,
            _ => {}
        }
        if inside == section && descriptor.name == name {
            return Some(descriptor);
        }
    }
    None
}

// ── Parsing ──────────────────────────────────────────────────────────────────

fn invalid(name: &str, detail: String) -> Error {
    Error::CorruptData(format!("config value '{name}': {detail}"))
}

fn split_unit<'v>(value: &'v str, units: &[(&str, i64)]) -> (&'v str, i64, Option<String>) {
    let trimmed = value.trim();
    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '-' && c != '+' && c != '.')
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(digits_end);
    let unit = unit.trim();
    if unit.is_empty() {
        return (number, 1, None);
    }
    for (unit_name, factor) in units {
        if unit.eq_ignore_ascii_case(unit_name) {
            return (number, *factor, None);
        }
    }
    let valid: Vec<&str> = units.iter().map(|(n, _)| *n).collect();
    (number, 1, Some(format!("unknown unit '{unit}' (valid: {})", valid.join(", "))))
}

/// Parse a number with an optional unit suffix ("3M", "512") and scale it.
pub fn parse_scaled(name: &str, value: &str, units: &[(&str, i64)]) -> Result<i64> {
    let (number, factor, unit_error) = split_unit(value, units);
    if let Some(detail) = unit_error {
        return Err(invalid(name, detail));
    }
    let base: i64 = number
        .trim()
        .parse()
        .map_err(|_| invalid(name, format!("'{value}' is not a number")))?;
    base.checked_mul(factor)
        .ok_or_else(|| invalid(name, format!("'{value}' overflows")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "yes" | "true" | "on" | "1" => Ok(true),
        "no" | "false" | "off" | "0" => Ok(false),
        other => Err(invalid(name, format!("'{other}' is not a boolean"))),
    }
}

/// Parse one `name = value` assignment into the target.
pub fn parse_value<T>(
    table: &[ConfigDescriptor<T>],
    target: &mut T,
    section: Option<&str>,
    name: &str,
    value: &str,
    deprecations: &mut DeprecationWarnings,
) -> Result<()> {
    let descriptor = find(table, section, name).ok_or_else(|| {
        let place = section.map_or_else(|| "default section".into(), |s| format!("section [{s}]"));
        Error::CorruptData(format!("unknown config value '{name}' in {place}"))
    })?;

    match &descriptor.kind {
        ValueKind::Integer { set, min, max, units, .. }
        | ValueKind::Int64 { set, min, max, units, .. } => {
            let scaled = parse_scaled(name, value, units)?;
            if scaled < *min || scaled > *max {
                return Err(invalid(name, format!("{scaled} out of range {min}..{max}")));
            }
            set(target, scaled);
        }
        ValueKind::Double { set, min, max, .. } => {
            let parsed: f64 = value
                .trim()
                .parse()
                .map_err(|_| invalid(name, format!("'{value}' is not a number")))?;
            if parsed < *min || parsed > *max {
                return Err(invalid(name, format!("{parsed} out of range {min}..{max}")));
            }
            set(target, parsed);
        }
        ValueKind::Bool { set, .. } => set(target, parse_bool(name, value)?),
        ValueKind::Enum { set, value: fixed } => set(target, *fixed),
        ValueKind::Select { set, table: select, .. } => {
            let token = value.trim();
            let matched = select
                .iter()
                .find(|(candidate, _)| candidate.eq_ignore_ascii_case(token))
                .ok_or_else(|| {
                    let valid: Vec<&str> = select.iter().map(|(n, _)| *n).collect();
                    invalid(name, format!("'{token}' is not one of {}", valid.join(", ")))
                })?;
            set(target, matched.1);
        }
        ValueKind::Set { set, table: flags, .. } => {
            let mut mask = 0u64;
            for token in value.split(|c: char| c.is_whitespace() || c == ',') {
                let token = token.trim();
                if token.is_empty() {
                    continue;
                }
                let matched = flags
                    .iter()
                    .find(|(candidate, _)| candidate.eq_ignore_ascii_case(token))
                    .ok_or_else(|| {
                        let valid: Vec<&str> = flags.iter().map(|(n, _)| *n).collect();
                        invalid(name, format!("'{token}' is not one of {}", valid.join(", ")))
                    })?;
                mask |= matched.1;
            }
            set(target, mask);
        }
        ValueKind::String { set, .. } => set(target, value.trim().to_string()),
        ValueKind::Special { parse, .. } => {
            let mut scratch = String::new();
            if !parse(target, value, &mut scratch) {
                return Err(invalid(name, scratch));
            }
        }
        ValueKind::Comment(_) | ValueKind::BeginSection | ValueKind::EndSection => {
            return Err(Error::Internal(format!("descriptor '{name}' is not a value")));
        }
        ValueKind::Deprecated { replacement } => {
            if deprecations.warned.insert(descriptor.name) {
                match replacement {
                    Some(replacement) => warn!(
                        "config value '{name}' is deprecated, use '{replacement}' instead"
                    ),
                    None => warn!("config value '{name}' is deprecated"),
                }
            }
        }
    }
    Ok(())
}

// ── Formatting ───────────────────────────────────────────────────────────────

/// Integer rendering with the largest unit that divides the value evenly.
pub fn format_scaled(value: i64, units: &[(&str, i64)]) -> String {
    if value != 0 {
        for (unit_name, factor) in units {
            if *factor > 1 && value % factor == 0 {
                return format!("{}{}", value / factor, unit_name);
            }
        }
    }
    value.to_string()
}

/// Multi-line formatter state: formatInit / formatNext / formatDone as an
/// iterator over emitted lines.
pub struct FormatLines {
    lines: std::vec::IntoIter<String>,
}

impl Iterator for FormatLines {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.lines.next()
    }
}

/// Format one descriptor's current value as `name = value` lines.
/// Comments, sections and deprecated entries yield nothing.
pub fn format_value<T>(descriptor: &ConfigDescriptor<T>, target: &T) -> FormatLines {
    let name = descriptor.name;
    let lines = match &descriptor.kind {
        ValueKind::Integer { get, units, .. } | ValueKind::Int64 { get, units, .. } => {
            vec![format!("{name} = {}", format_scaled(get(target), units))]
        }
        ValueKind::Double { get, .. } => vec![format!("{name} = {:.6}", get(target))],
        ValueKind::Bool { get, .. } => {
            vec![format!("{name} = {}", if get(target) { "yes" } else { "no" })]
        }
        ValueKind::Select { get, table, .. } => {
            let current = get(target);
            let label = table
                .iter()
                .find(|(_, v)| *v == current)
                .map(|(n, _)| *n)
                .unwrap_or("?");
            vec![format!("{name} = {label}")]
        }
        ValueKind::Set { get, table, .. } => {
            let mask = get(target);
            let names: Vec<&str> = table
                .iter()
                .filter(|(_, bit)| mask & bit != 0)
                .map(|(n, _)| *n)
                .collect();
            vec![format!("{name} = {}", names.join(","))]
        }
        ValueKind::String { get, .. } => vec![format!("{name} = {}", get(target))],
        ValueKind::Special { format, .. } => match format {
            Some(format) => format(target)
                .into_iter()
                .map(|line| format!("{name} = {line}"))
                .collect(),
            None => Vec::new(),
        },
        ValueKind::Enum { .. }
        | ValueKind::Comment(_)
        | ValueKind::BeginSection
        | ValueKind::EndSection
        | ValueKind::Deprecated { .. } => Vec::new(),
    };
    FormatLines { lines: lines.into_iter() }
}

// ── Config-file text ─────────────────────────────────────────────────────────

/// Apply an INI-like config text: `[section]` … `[end]` scoping,
/// `name = value` lines, `#` comments, UTF-8, no line continuation.
pub fn parse_config_text<T>(
    table: &[ConfigDescriptor<T>],
    target: &mut T,
    text: &str,
    deprecations: &mut DeprecationWarnings,
) -> Result<()> {
    let mut section: Option<String> = None;
    for (line_number, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let header = header.trim();
            if header.eq_ignore_ascii_case("end") {
                section = None;
            } else {
                section = Some(header.to_string());
            }
            continue;
        }
        let Some((name, value)) = line.split_once('=') else {
            return Err(Error::CorruptData(format!(
                "config line {}: expected 'name = value', got '{line}'",
                line_number + 1
            )));
        };
        parse_value(
            table,
            target,
            section.as_deref(),
            name.trim(),
            value.trim(),
            deprecations,
        )?;
    }
    Ok(())
}

// ── Line-buffer editing ──────────────────────────────────────────────────────

fn is_section_header(line: &str, name: &str) -> bool {
    line.trim()
        .strip_prefix('[')
        .and_then(|l| l.strip_suffix(']'))
        .map(|h| h.trim().eq_ignore_ascii_case(name))
        .unwrap_or(false)
}

fn is_entry_line(line: &str, name: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed
        .strip_prefix(name)
        .map(|rest| rest.trim_start().starts_with('='))
        .unwrap_or(false)
}

fn trim_blank_edges(lines: &mut Vec<String>) {
    while lines.first().is_some_and(|l| l.trim().is_empty()) {
        lines.remove(0);
    }
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
}

/// Delete a whole `[name]` … `[end]` block from a config line buffer.
/// Comments and blank lines elsewhere are preserved; leading/trailing
/// blank lines are trimmed afterwards.
pub fn delete_section(lines: &mut Vec<String>, name: &str) {
    let mut result = Vec::with_capacity(lines.len());
    let mut skipping = false;
    for line in lines.drain(..) {
        if skipping {
            if line.trim().eq_ignore_ascii_case("[end]") {
                skipping = false;
            }
            continue;
        }
        if is_section_header(&line, name) {
            skipping = true;
            continue;
        }
        result.push(line);
    }
    *lines = result;
    trim_blank_edges(lines);
}

/// Delete every `name = …` assignment, either in one `[section]` or in the
/// default section when `section` is `None`.
pub fn delete_entry(lines: &mut Vec<String>, section: Option<&str>, name: &str) {
    let mut result = Vec::with_capacity(lines.len());
    let mut inside: Option<String> = None;
    for line in lines.drain(..) {
        let trimmed = line.trim();
        if let Some(header) = trimmed.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let header = header.trim();
            if header.eq_ignore_ascii_case("end") {
                inside = None;
            } else {
                inside = Some(header.to_string());
            }
            result.push(line);
            continue;
        }
        let in_scope = match (&inside, section) {
            (None, None) => true,
            (Some(current), Some(wanted)) => current.eq_ignore_ascii_case(wanted),
            _ => false,
        };
        if in_scope && is_entry_line(&line, name) {
            continue;
        }
        result.push(line);
    }
    *lines = result;
    trim_blank_edges(lines);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Limits {
        max_size: i64,
    }

    #[derive(Default)]
    struct TestConfig {
        part_size: i64,
        threads: i64,
        ratio: f64,
        verbose: bool,
        mode: i64,
        flags: u64,
        comment: String,
        // Optional subsystem: values are discarded while absent.
        limits: Option<Limits>,
    }

    const FLAG_A: u64 = 0x1;
    const FLAG_B: u64 = 0x2;
    const FLAG_C: u64 = 0x4;

    fn table() -> Vec<ConfigDescriptor<TestConfig>> {
        vec![
            ConfigDescriptor {
                name: "archive-part-size",
                kind: ValueKind::Int64 {
                    set: |c, v| c.part_size = v,
                    get: |c| c.part_size,
                    min: 0,
                    max: i64::MAX,
                    units: BYTE_UNITS,
                },
            },
            ConfigDescriptor {
                name: "max-threads",
                kind: ValueKind::Integer {
                    set: |c, v| c.threads = v,
                    get: |c| c.threads,
                    min: 0,
                    max: 1024,
                    units: &[],
                },
            },
            ConfigDescriptor {
                name: "ratio",
                kind: ValueKind::Double {
                    set: |c, v| c.ratio = v,
                    get: |c| c.ratio,
                    min: 0.0,
                    max: 1.0,
                },
            },
            ConfigDescriptor {
                name: "verbose",
                kind: ValueKind::Bool { set: |c, v| c.verbose = v, get: |c| c.verbose },
            },
            ConfigDescriptor {
                name: "mode",
                kind: ValueKind::Select {
                    set: |c, v| c.mode = v,
                    get: |c| c.mode,
                    table: &[("normal", 0), ("full", 1), ("incremental", 2)],
                },
            },
            ConfigDescriptor {
                name: "log",
                kind: ValueKind::Set {
                    set: |c, mask| c.flags |= mask,
                    get: |c| c.flags,
                    table: &[("errors", FLAG_A), ("warnings", FLAG_B), ("info", FLAG_C)],
                },
            },
            ConfigDescriptor {
                name: "comment",
                kind: ValueKind::String {
                    set: |c, v| c.comment = v,
                    get: |c| c.comment.clone(),
                },
            },
            ConfigDescriptor { name: "limits", kind: ValueKind::BeginSection },
            ConfigDescriptor {
                name: "max-size",
                kind: ValueKind::Int64 {
                    set: |c, v| {
                        if let Some(limits) = c.limits.as_mut() {
                            limits.max_size = v;
                        }
                    },
                    get: |c| c.limits.as_ref().map_or(0, |l| l.max_size),
                    min: 0,
                    max: i64::MAX,
                    units: BYTE_UNITS,
                },
            },
            ConfigDescriptor { name: "limits", kind: ValueKind::EndSection },
            ConfigDescriptor {
                name: "compress",
                kind: ValueKind::Deprecated { replacement: Some("compress-algorithm") },
            },
        ]
    }

    #[test]
    fn scaled_units_and_ranges() {
        let table = table();
        let mut config = TestConfig::default();
        let mut deprecations = DeprecationWarnings::default();
        parse_value(&table, &mut config, None, "archive-part-size", "3M", &mut deprecations)
            .unwrap();
        assert_eq!(config.part_size, 3 << 20);

        let err =
            parse_value(&table, &mut config, None, "archive-part-size", "3Q", &mut deprecations)
                .unwrap_err();
        assert!(err.to_string().contains("valid: T, G, M, K"), "{err}");

        let err = parse_value(&table, &mut config, None, "max-threads", "2000", &mut deprecations)
            .unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn select_set_bool_and_string() {
        let table = table();
        let mut config = TestConfig::default();
        let mut deprecations = DeprecationWarnings::default();
        parse_value(&table, &mut config, None, "mode", "incremental", &mut deprecations).unwrap();
        assert_eq!(config.mode, 2);
        parse_value(&table, &mut config, None, "log", "errors, info", &mut deprecations).unwrap();
        parse_value(&table, &mut config, None, "log", "warnings", &mut deprecations).unwrap();
        assert_eq!(config.flags, FLAG_A | FLAG_B | FLAG_C, "set values OR together");
        parse_value(&table, &mut config, None, "verbose", "yes", &mut deprecations).unwrap();
        assert!(config.verbose);
        parse_value(&table, &mut config, None, "comment", "weekly backup", &mut deprecations)
            .unwrap();
        assert_eq!(config.comment, "weekly backup");
    }

    #[test]
    fn sections_scope_lookup() {
        let table = table();
        let mut config = TestConfig { limits: Some(Limits::default()), ..TestConfig::default() };
        let mut deprecations = DeprecationWarnings::default();

        // Section entries are invisible from the default section.
        assert!(parse_value(&table, &mut config, None, "max-size", "1K", &mut deprecations)
            .is_err());
        // Default entries are invisible from inside a section.
        assert!(parse_value(
            &table,
            &mut config,
            Some("limits"),
            "verbose",
            "yes",
            &mut deprecations
        )
        .is_err());

        parse_value(&table, &mut config, Some("limits"), "max-size", "2K", &mut deprecations)
            .unwrap();
        assert_eq!(config.limits.as_ref().unwrap().max_size, 2048);
    }

    #[test]
    fn absent_subsystem_discards_silently() {
        let table = table();
        let mut config = TestConfig::default(); // limits: None
        let mut deprecations = DeprecationWarnings::default();
        parse_value(&table, &mut config, Some("limits"), "max-size", "2K", &mut deprecations)
            .unwrap();
        assert!(config.limits.is_none());
    }

    #[test]
    fn deprecated_warns_once_per_option() {
        let table = table();
        let mut config = TestConfig::default();
        let mut deprecations = DeprecationWarnings::default();
        parse_value(&table, &mut config, None, "compress", "zstd", &mut deprecations).unwrap();
        parse_value(&table, &mut config, None, "compress", "zstd", &mut deprecations).unwrap();
        assert_eq!(deprecations.warned.len(), 1);
    }

    #[test]
    fn config_text_with_sections() {
        let table = table();
        let mut config = TestConfig { limits: Some(Limits::default()), ..TestConfig::default() };
        let mut deprecations = DeprecationWarnings::default();
        parse_config_text(
            &table,
            &mut config,
            "# weekly job\n\
             archive-part-size = 1G\n\
             verbose = no\n\
             \n\
             [limits]\n\
             max-size = 16M\n\
             [end]\n\
             mode = full\n",
            &mut deprecations,
        )
        .unwrap();
        assert_eq!(config.part_size, 1 << 30);
        assert_eq!(config.limits.as_ref().unwrap().max_size, 16 << 20);
        assert_eq!(config.mode, 1);
    }

    #[test]
    fn formatting_uses_largest_even_unit() {
        assert_eq!(format_scaled(3 << 20, BYTE_UNITS), "3M");
        assert_eq!(format_scaled(1536, BYTE_UNITS), "1536"); // no even divisor above K? 1536 = 1.5K
        assert_eq!(format_scaled(2048, BYTE_UNITS), "2K");
        assert_eq!(format_scaled(1 << 40, BYTE_UNITS), "1T");
        assert_eq!(format_scaled(0, BYTE_UNITS), "0");

        let table = table();
        let config = TestConfig {
            part_size: 2 << 30,
            verbose: true,
            flags: FLAG_A | FLAG_C,
            mode: 2,
            ..TestConfig::default()
        };
        let line = |name: &str| {
            let descriptor = table.iter().find(|d| d.name == name).unwrap();
            format_value(descriptor, &config).collect::<Vec<_>>().join("\n")
        };
        assert_eq!(line("archive-part-size"), "archive-part-size = 2G");
        assert_eq!(line("verbose"), "verbose = yes");
        assert_eq!(line("log"), "log = errors,info");
        assert_eq!(line("mode"), "mode = incremental");
    }

    #[test]
    fn delete_section_and_entry_preserve_comments() {
        let text = "\n# header comment\nname = 1\n\n[jobs]\nname = 2\n# job comment\n[end]\nother = 3\n\n";
        let mut lines: Vec<String> = text.lines().map(String::from).collect();
        delete_section(&mut lines, "jobs");
        assert_eq!(
            lines,
            vec!["# header comment", "name = 1", "", "other = 3"],
        );

        let mut lines: Vec<String> =
            vec!["a = 1".into(), "[s]".into(), "a = 2".into(), "[end]".into(), "a = 3".into()];
        delete_entry(&mut lines, None, "a");
        assert_eq!(lines, vec!["[s]", "a = 2", "[end]"]);

        let mut lines: Vec<String> =
            vec!["a = 1".into(), "[s]".into(), "a = 2".into(), "[end]".into()];
        delete_entry(&mut lines, Some("s"), "a");
        assert_eq!(lines, vec!["a = 1", "[s]", "[end]"]);
    }
}
