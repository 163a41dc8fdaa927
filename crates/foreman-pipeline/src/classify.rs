use foreman_core::types::FailureSignature;

// ---------------------------------------------------------------------------
// Detectors
// ---------------------------------------------------------------------------

/// Ordered needle tables. The first detector with a hit wins, so the
/// more specific signatures come before the broader ones.
const DETECTORS: &[(FailureSignature, &[&str])] = &[
    (
        FailureSignature::MissingCurrentState,
        &[
            "current state",
            "no such file",
            "does not exist",
            "file not found",
            "stale",
            "out of date",
        ],
    ),
    (
        FailureSignature::VagueRequirements,
        &["ambiguous", "unclear", "vague", "underspecified"],
    ),
    (
        FailureSignature::SyntaxError,
        &[
            "syntax error",
            "parse error",
            "unexpected token",
            "invalid syntax",
            "compile error",
            "compilation failed",
        ],
    ),
    (
        FailureSignature::TestFailure,
        &[
            "test failed",
            "tests failed",
            "test failure",
            "failing test",
            "assertion",
        ],
    ),
    (
        FailureSignature::Timeout,
        &["timed out", "timeout", "deadline exceeded"],
    ),
];

/// Classify a failed attempt's error text into a coarse signature.
///
/// Matching is case-insensitive substring search over a small ordered
/// needle table. Anything no detector recognizes is `Unknown`; the
/// attempt history still keeps the raw error text.
pub fn classify_failure(error: &str) -> FailureSignature {
    let haystack = error.to_lowercase();
    for (signature, needles) in DETECTORS {
        if needles.iter().any(|needle| haystack.contains(needle)) {
            return *signature;
        }
    }
    FailureSignature::Unknown
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
