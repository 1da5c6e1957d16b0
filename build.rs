use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding this crate's Rust sources. Anything else under the
// package root (vendored data, reference material) is not scanned.
const SOURCE_ROOTS: [&str; 4] = ["density", "src", "tests", "benches"];

/// One source policy: a line regex plus a filter deciding which matches count.
struct Rule {
    name: &'static str,
    pattern: &'static str,
    hint: &'static str,
    accept: fn(&str) -> bool,
}

// Collects violating lines of a single file for one rule.
struct ViolationCollector {
    violations: Vec<String>,
    file_path: PathBuf,
    accept: fn(&str) -> bool,
}

impl ViolationCollector {
    fn new(file_path: &Path, accept: fn(&str) -> bool) -> Self {
        Self {
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
            accept,
        }
    }

    fn check_and_get_error_message(&self, rule: &Rule) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let file_name = self.file_path.to_str().unwrap_or("?");
        let mut error_msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            rule.name,
            file_name
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!("\n⚠️ {}\n", rule.hint));
        Some(error_msg)
    }
}

impl Sink for ViolationCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();

        if (self.accept)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("//") || trimmed.starts_with("/*")
}

fn comment_text(line: &str) -> &str {
    let trimmed = line.trim_start();
    trimmed.trim_start_matches('/').trim_start_matches('!').trim()
}

// An identifier match is ignored inside comments and string literals.
fn underscore_in_code(line: &str) -> bool {
    if is_comment(line) {
        return false;
    }
    !line
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

fn all_caps_comment(line: &str) -> bool {
    if !is_comment(line) {
        return false;
    }
    let mut letters = comment_text(line).chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(char::is_uppercase)
}

fn any_match(_: &str) -> bool {
    true
}

const RULES: [Rule; 4] = [
    Rule {
        name: "underscore-prefixed identifiers",
        pattern: r"\b(_[a-zA-Z0-9_]+)\b",
        hint: "Underscore-prefixed names are not allowed. Use the binding or remove it.",
        accept: underscore_in_code,
    },
    Rule {
        name: "forbidden comment words",
        pattern: r"(//|/\*).*(?:FIXED|CORRECTED|FIX|CHANGED|CHANGE|MODIFIED|UPDATED|UPDATE)",
        hint: "Comments describing edits belong in version control, not in the source.",
        accept: any_match,
    },
    Rule {
        name: "all-uppercase comments",
        pattern: r"(//|/\*).*",
        hint: "Comments where every letter is uppercase are not allowed.",
        accept: all_caps_comment,
    },
    Rule {
        name: "#[allow(dead_code)] attributes",
        pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        hint: "Use the code or delete it; dead code may not be silenced.",
        accept: any_match,
    },
];

fn rust_sources() -> impl Iterator<Item = PathBuf> {
    SOURCE_ROOTS
        .iter()
        .flat_map(|root| WalkDir::new(root).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
}

fn scan(rule: &Rule) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
    let mut searcher = Searcher::new();

    for path in rust_sources() {
        let mut collector = ViolationCollector::new(&path, rule.accept);
        searcher.search_path(&matcher, &path, &mut collector)?;
        if let Some(error_message) = collector.check_and_get_error_message(rule) {
            return Err(error_message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    for rule in &RULES {
        if let Err(e) = scan(rule) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
