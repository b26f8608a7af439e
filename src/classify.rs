//! Query Classification
//!
//! Decides whether a query should take the retrieval-augmented path or
//! the purely conversational path. The default is a keyword-membership
//! check over the lowercased query; the trait keeps the policy
//! replaceable so a model-based classifier can be swapped in without
//! touching the router.

/// The two generation paths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// Dialogue-history-only prompt
    Conversational,
    /// Prompt grounded in retrieved document context
    InformationSeeking,
}

/// Replaceable classification policy
pub trait QueryClassifier: Send + Sync {
    fn classify(&self, query: &str) -> QueryKind;
}

// Terms whose presence routes to the retrieval-augmented path
static RETRIEVAL_KEYWORDS: &[&str] = &[
    "how to", "how do i", "how does",
    "what is", "what are",
    "pricing", "price", "cost", "billing", "plan",
    "setup", "set up", "install", "configure", "configuration",
    "error", "issue", "problem", "troubleshoot", "fix", "fail",
    "documentation", "docs", "guide", "tutorial", "faq",
    "feature", "integration", "api", "support",
    "requirements", "getting started",
];

/// Keyword-membership classifier
pub struct KeywordClassifier;

impl QueryClassifier for KeywordClassifier {
    fn classify(&self, query: &str) -> QueryKind {
        let lower = query.to_lowercase();
        if RETRIEVAL_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            QueryKind::InformationSeeking
        } else {
            QueryKind::Conversational
        }
    }
}
