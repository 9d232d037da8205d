//! Query and route types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Retrieval strategy for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Single-hop lookup from directly named entities
    FastLookup,
    /// Full traversal from the query's entities
    EntityFocused,
    /// Decompose, fan out per sub-question, consolidate
    MultiHop,
}

impl Route {
    pub const ALL: [Route; 3] = [Route::FastLookup, Route::EntityFocused, Route::MultiHop];

    pub fn as_str(&self) -> &'static str {
        match self {
            Route::FastLookup => "fast_lookup",
            Route::EntityFocused => "entity_focused",
            Route::MultiHop => "multi_hop",
        }
    }

    /// Label used in the classification prompt taxonomy
    pub fn label(&self) -> &'static str {
        match self {
            Route::FastLookup => "FAST_LOOKUP",
            Route::EntityFocused => "ENTITY_FOCUSED",
            Route::MultiHop => "MULTI_HOP",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Route {
    type Err = String;

    /// Accepts both snake_case names and classifier labels, case-insensitively
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "fast_lookup" | "fastlookup" => Ok(Route::FastLookup),
            "entity_focused" | "entityfocused" => Ok(Route::EntityFocused),
            "multi_hop" | "multihop" => Ok(Route::MultiHop),
            _ => Err(format!("unknown route: {}", s)),
        }
    }
}

/// Response verbosity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    /// Brief, to-the-point
    Concise,
    /// Balanced answer
    #[default]
    Standard,
    /// Comprehensive explanation
    Detailed,
}

/// Sampling parameters for the synthesis call
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            top_p: 1.0,
        }
    }
}

/// Incoming question. Immutable for the lifetime of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub text: String,

    #[serde(default)]
    pub forced_route: Option<Route>,

    #[serde(default)]
    pub verbosity: Verbosity,

    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Caller-supplied isolation scope
    #[serde(default)]
    pub scope: Option<String>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            forced_route: None,
            verbosity: Verbosity::default(),
            sampling: SamplingConfig::default(),
            scope: None,
        }
    }

    pub fn with_route(mut self, route: Route) -> Self {
        self.forced_route = Some(route);
        self
    }

    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }
}
