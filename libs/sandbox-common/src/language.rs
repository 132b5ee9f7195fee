//! Language profiles
//!
//! Every supported language is a row in `PROFILES`. Adding a language means
//! adding a row here and a variant to `Language`; runners never branch on the
//! language themselves.

use regex::Regex;

use crate::types::Language;

/// Mount point of the per-attempt workspace inside the container
pub const SANDBOX_DIR: &str = "/sandbox";

/// Rule for languages whose runtime needs a named top-level entry point.
///
/// Extraction is a best-effort regex scan: comments, string literals or
/// adversarial source can defeat it, in which case the fallback name is used
/// and the compile/run step reports the mismatch as an ordinary error.
#[derive(Debug, Clone, Copy)]
pub struct EntryPointRule {
    /// Regex whose first capture group is the entry-point name
    pub pattern: &'static str,
    pub fallback: &'static str,
}

impl EntryPointRule {
    pub fn extract(&self, source: &str) -> String {
        Regex::new(self.pattern)
            .ok()
            .and_then(|re| re.captures(source))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| self.fallback.to_string())
    }
}

/// How to build and run one language inside the sandbox image.
///
/// Command templates understand three placeholders:
/// `{dir}` (workspace mount), `{source}` (source file path) and `{stem}`
/// (source file name without extension, i.e. the entry-point name).
#[derive(Debug, Clone, Copy)]
pub struct LanguageProfile {
    pub language: Language,
    pub extension: &'static str,
    pub default_stem: &'static str,
    pub entry_point: Option<EntryPointRule>,
    pub compile: Option<&'static [&'static str]>,
    pub run: &'static [&'static str],
    pub env: &'static [(&'static str, &'static str)],
}

static PROFILES: &[LanguageProfile] = &[
    LanguageProfile {
        language: Language::Javascript,
        extension: "js",
        default_stem: "main",
        entry_point: None,
        compile: None,
        run: &["node", "{source}"],
        env: &[],
    },
    LanguageProfile {
        language: Language::Python,
        extension: "py",
        default_stem: "main",
        entry_point: None,
        compile: None,
        run: &["python3", "-u", "{source}"],
        env: &[("PYTHONDONTWRITEBYTECODE", "1")],
    },
    LanguageProfile {
        language: Language::Java,
        extension: "java",
        default_stem: "Main",
        entry_point: Some(EntryPointRule {
            pattern: r"public\s+(?:(?:final|abstract|static)\s+)*class\s+([A-Za-z_$][A-Za-z0-9_$]*)",
            fallback: "Main",
        }),
        compile: Some(&["javac", "-encoding", "UTF-8", "-d", "{dir}", "{source}"]),
        run: &[
            "java",
            // Heap follows the container memory limit, leaving headroom
            // for the rest of the JVM
            "-XX:MaxRAMPercentage=75.0",
            "-Xss256k",
            "-XX:+UseSerialGC",
            "-cp",
            "{dir}",
            "{stem}",
        ],
        env: &[],
    },
    LanguageProfile {
        language: Language::Go,
        extension: "go",
        default_stem: "main",
        entry_point: None,
        compile: Some(&["go", "build", "-o", "{dir}/main.bin", "{source}"]),
        run: &["{dir}/main.bin"],
        env: &[
            ("GOCACHE", "/tmp/go-cache"),
            ("HOME", "/tmp"),
            ("CGO_ENABLED", "0"),
        ],
    },
    LanguageProfile {
        language: Language::Cpp,
        extension: "cpp",
        default_stem: "main",
        entry_point: None,
        compile: Some(&[
            "g++",
            "-O2",
            "-std=c++17",
            "-o",
            "{dir}/main.bin",
            "{source}",
        ]),
        run: &["{dir}/main.bin"],
        env: &[],
    },
];

impl Language {
    /// Look up the profile for this language
    pub fn profile(&self) -> &'static LanguageProfile {
        PROFILES
            .iter()
            .find(|p| p.language == *self)
            .unwrap_or_else(|| unreachable!("every Language variant has a profile"))
    }
}

impl LanguageProfile {
    pub fn requires_compile(&self) -> bool {
        self.compile.is_some()
    }

    /// File stem for the submitted source (entry-point name when required)
    pub fn source_stem(&self, source: &str) -> String {
        match &self.entry_point {
            Some(rule) => rule.extract(source),
            None => self.default_stem.to_string(),
        }
    }

    pub fn source_file_name(&self, stem: &str) -> String {
        format!("{}.{}", stem, self.extension)
    }

    pub fn compile_command(&self, stem: &str) -> Option<Vec<String>> {
        self.compile.map(|template| self.render(template, stem))
    }

    pub fn run_command(&self, stem: &str) -> Vec<String> {
        self.render(self.run, stem)
    }

    pub fn environment(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }

    fn render(&self, template: &[&str], stem: &str) -> Vec<String> {
        let source = format!("{}/{}", SANDBOX_DIR, self.source_file_name(stem));
        template
            .iter()
            .map(|part| {
                part.replace("{source}", &source)
                    .replace("{dir}", SANDBOX_DIR)
                    .replace("{stem}", stem)
            })
            .collect()
    }
}
