use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable carrying the base64-encoded submission inside the container
pub const SOURCE_ENV: &str = "SUBMISSION_SOURCE";

/// Largest accepted source, in bytes
///
/// Its base64 form plus the variable name must stay under the kernel's
/// 128 KiB limit on a single environment string (`MAX_ARG_STRLEN`).
pub const MAX_SOURCE_BYTES: usize = 64 * 1024;

/// Languages known to the evaluator
///
/// Only the variants listed in [`Language::SUPPORTED`] can be executed. The
/// remaining ones are reserved tags: they parse, but every strategy lookup
/// rejects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Language {
    Python3,
    Cpp,
    Java,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unsupported language: {0}")]
pub struct UnsupportedLanguage(pub String);

impl Language {
    pub const SUPPORTED: [Language; 2] = [Language::Python3, Language::Cpp];

    pub fn as_str(self) -> &'static str {
        match self {
            Language::Python3 => "python3",
            Language::Cpp => "c++",
            Language::Java => "java",
        }
    }

    pub fn is_supported(self) -> bool {
        toolchain(self).is_ok()
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = UnsupportedLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python3" => Ok(Language::Python3),
            "c++" => Ok(Language::Cpp),
            "java" => Ok(Language::Java),
            other => Err(UnsupportedLanguage(other.to_string())),
        }
    }
}

impl TryFrom<String> for Language {
    type Error = UnsupportedLanguage;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Language> for String {
    fn from(language: Language) -> Self {
        language.as_str().to_string()
    }
}

/// Image and entry point used to run one language
struct Toolchain {
    image: &'static str,
    argv: &'static [&'static str],
}

const PYTHON3: Toolchain = Toolchain {
    image: "python:3.9-slim",
    argv: &[
        "python3",
        "-c",
        "import base64, os; \
         exec(compile(base64.b64decode(os.environ['SUBMISSION_SOURCE']), 'main.py', 'exec'))",
    ],
};

const CPP: Toolchain = Toolchain {
    image: "gcc:latest",
    argv: &[
        "/bin/sh",
        "-c",
        "printf '%s' \"$SUBMISSION_SOURCE\" | base64 -d > /tmp/main.cpp \
         && g++ -O2 -o /tmp/main /tmp/main.cpp \
         && exec /tmp/main",
    ],
};

fn toolchain(language: Language) -> Result<&'static Toolchain, UnsupportedLanguage> {
    match language {
        Language::Python3 => Ok(&PYTHON3),
        Language::Cpp => Ok(&CPP),
        Language::Java => Err(UnsupportedLanguage(language.to_string())),
    }
}

/// Argument vector and environment that run a submission inside its image
///
/// The source text only ever travels through `env`; `argv` is constant per
/// language, so no shell ever sees user input as syntax.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxCommand {
    pub argv: Vec<String>,
    pub env: Vec<String>,
}

pub fn image_for(language: Language) -> Result<&'static str, UnsupportedLanguage> {
    toolchain(language).map(|t| t.image)
}

pub fn command_for(language: Language, code: &str) -> Result<SandboxCommand, UnsupportedLanguage> {
    let toolchain = toolchain(language)?;

    Ok(SandboxCommand {
        argv: toolchain.argv.iter().map(|s| s.to_string()).collect(),
        env: vec![format!("{SOURCE_ENV}={}", STANDARD.encode(code))],
    })
}
