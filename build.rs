use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Every source-policy check runs a line regex over the crate and feeds matches to a
// `PolicyCollector`, which decides per line whether the match is a real violation.

#[derive(Clone, Copy, PartialEq, Eq)]
enum Policy {
    UnderscorePrefix,
    ForbiddenWords,
    StarsOutsideDocs,
    AllCapsComment,
    AllowDeadCode,
}

impl Policy {
    fn description(self) -> &'static str {
        match self {
            Policy::UnderscorePrefix => "underscore-prefixed variables",
            Policy::ForbiddenWords => "forbidden comment patterns",
            Policy::StarsOutsideDocs => "'**' patterns in regular comments",
            Policy::AllCapsComment => "comments with all uppercase alphabetic characters",
            Policy::AllowDeadCode => "#[allow(dead_code)] attributes",
        }
    }

    fn advice(self) -> &'static str {
        match self {
            Policy::UnderscorePrefix => {
                "Underscore-prefixed variable names are not allowed in this project.\n   Either use the variable (removing the underscore) or remove it completely."
            }
            Policy::ForbiddenWords => {
                "Change-log words ('FIXED', 'NEW', 'CHANGED', 'UPDATE' and the like) are STRICTLY FORBIDDEN in comments.\n   Remove them completely rather than commenting them out."
            }
            Policy::StarsOutsideDocs => {
                "The '**' pattern is not allowed in regular comments (but is allowed in doc comments)."
            }
            Policy::AllCapsComment => {
                "Comments where all alphabetic characters are uppercase are STRICTLY FORBIDDEN.\n   STRONGLY CONSIDER deleting the comment completely."
            }
            Policy::AllowDeadCode => {
                "#[allow(dead_code)] attributes are STRICTLY FORBIDDEN in this project.\n   Either use the code (removing the attribute) or remove it completely."
            }
        }
    }

    fn pattern(self) -> &'static str {
        match self {
            Policy::UnderscorePrefix => r"\b(_[a-zA-Z0-9_]+)\b",
            Policy::ForbiddenWords => {
                r"(//|/\*|///).*(?:FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE)"
            }
            Policy::StarsOutsideDocs => r"(//|/\*).*\*\*",
            Policy::AllCapsComment => r"(//|/\*|///).*",
            Policy::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        }
    }

    /// Whether a regex match on `line` is an actual violation of this policy.
    fn is_violation(self, line: &str) -> bool {
        match self {
            Policy::UnderscorePrefix => !is_comment(line) && !underscore_only_in_strings(line),
            Policy::ForbiddenWords | Policy::AllowDeadCode => true,
            Policy::StarsOutsideDocs => !is_doc_comment(line),
            Policy::AllCapsComment => comment_text(line).is_some_and(|text| {
                let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
                letters.peek().is_some() && letters.all(char::is_uppercase)
            }),
        }
    }
}

struct PolicyCollector {
    policy: Policy,
    violations: Vec<String>,
    file_path: PathBuf,
}

impl PolicyCollector {
    fn new(policy: Policy, file_path: &Path) -> Self {
        Self {
            policy,
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
        }
    }

    fn check_and_get_error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }
        let mut error_msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.policy.description(),
            self.file_path.display()
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!("\n⚠️ {}\n", self.policy.advice()));
        Some(error_msg)
    }
}

impl Sink for PolicyCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.policy.is_violation(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        // Keep searching so one report lists every violation in the file.
        Ok(true)
    }
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with("//") || line.contains("/*")
}

fn is_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///")
}

/// True when every underscore on the line sits inside a string literal.
fn underscore_only_in_strings(line: &str) -> bool {
    line.contains('"')
        && line
            .split('"')
            .enumerate()
            .any(|(index, part)| index % 2 == 1 && part.contains('_'))
}

/// The text of a line comment or block comment, without its markers.
fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("///") {
        Some(rest.trim())
    } else if let Some(rest) = trimmed.strip_prefix("//") {
        Some(rest.trim())
    } else if let Some(index) = line.find("/*") {
        let rest = &line[index + 2..];
        Some(rest.find("*/").map_or(rest, |end| &rest[..end]).trim())
    } else {
        None
    }
}

/// The directories holding this crate's own Rust sources. Nothing else is linted.
const SOURCE_ROOTS: [&str; 3] = ["score", "src", "tests"];

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    // The build script must follow the same policy as the crate.
    check_build_script_lints();

    let policies = [
        Policy::UnderscorePrefix,
        Policy::ForbiddenWords,
        Policy::StarsOutsideDocs,
        Policy::AllCapsComment,
        Policy::AllowDeadCode,
    ];
    for policy in policies {
        if let Err(e) = scan(policy) {
            // Printed to stderr so cargo shows it with the failure.
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

fn check_build_script_lints() {
    let output = std::process::Command::new("rustc")
        .args([
            "--edition",
            "2021",
            "-D",
            "unused_variables",
            "-D",
            "dead_code",
            "-D",
            "unused_imports",
            "--crate-type",
            "bin",
            "--error-format",
            "human",
            "-o",
        ])
        .arg(std::env::temp_dir().join("polyscore-build-lint"))
        .arg("build.rs")
        .output();

    match output {
        Ok(output) if !output.status.success() => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let finding = if stderr.contains("unused variable") {
                Some("Unused variables")
            } else if stderr.contains("is never used") {
                Some("Unused functions")
            } else if stderr.contains("unused import") {
                Some("Unused imports")
            } else {
                None
            };
            if let Some(finding) = finding {
                eprintln!("\n❌ ERROR: {finding} detected in build.rs!");
                eprintln!("{stderr}");
                eprintln!("\n⚠️ {finding} are STRICTLY FORBIDDEN in this project.");
                std::process::exit(1);
            }
        }
        Ok(_) => {}
        Err(_) => {
            println!("cargo:warning=Could not lint build.rs with rustc");
        }
    }
}

/// Every `.rs` file under the source roots.
fn rust_sources() -> Vec<PathBuf> {
    SOURCE_ROOTS
        .iter()
        .flat_map(|root| WalkDir::new(root).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

fn scan(policy: Policy) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(policy.pattern())?;
    let mut searcher = Searcher::new();
    for path in rust_sources() {
        let mut collector = PolicyCollector::new(policy, &path);
        searcher.search_path(&matcher, &path, &mut collector)?;
        if let Some(error_message) = collector.check_and_get_error_message() {
            return Err(error_message.into());
        }
    }
    Ok(())
}
