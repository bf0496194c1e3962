//! Open-ended question routing into profile buckets.

use formbridge_core::ProfileLayout;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Route {
    pub keyword: String,
    pub bucket: String,
    #[serde(default)]
    pub label: Option<String>,
    /// Lower runs first; defaults to the route's position in the file.
    #[serde(default)]
    pub priority: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingRules {
    #[allow(dead_code)]
    version: u32,
    #[serde(default = "default_fold_len")]
    pub catch_all_title_len: usize,
    #[serde(default)]
    pub skip_values: Vec<String>,
    pub layout: ProfileLayout,
    #[serde(default)]
    pub routes: Vec<Route>,
}

fn default_fold_len() -> usize {
    60
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteMatch<'a> {
    pub bucket: &'a str,
    pub sub_label: Option<&'a str>,
}

#[derive(Debug, Clone)]
struct CompiledRoute {
    priority: u32,
    keyword: String,
    bucket: String,
    label: Option<String>,
}

/// Classifies question titles into profile buckets; first keyword hit wins.
#[derive(Debug, Clone)]
pub struct ProfileRouter {
    routes: Vec<CompiledRoute>,
    skip_values: Vec<String>,
    fold_len: usize,
    layout: ProfileLayout,
}

/// Lowercase and fold typographic apostrophes so titles match typed keywords.
pub(crate) fn fold_text(text: &str) -> String {
    text.trim().to_lowercase().replace('\u{2019}', "'")
}

impl ProfileRouter {
    pub fn new(rules: &RoutingRules) -> Self {
        let mut routes: Vec<CompiledRoute> = rules
            .routes
            .iter()
            .enumerate()
            .map(|(idx, route)| CompiledRoute {
                priority: route.priority.unwrap_or(idx as u32),
                keyword: fold_text(&route.keyword),
                bucket: route.bucket.clone(),
                label: route.label.clone(),
            })
            .filter(|route| !route.keyword.is_empty())
            .collect();
        // stable: equal priorities keep file order
        routes.sort_by_key(|route| route.priority);

        Self {
            routes,
            skip_values: rules.skip_values.iter().map(|v| fold_text(v)).collect(),
            fold_len: rules.catch_all_title_len.max(1),
            layout: rules.layout.clone(),
        }
    }

    pub fn layout(&self) -> &ProfileLayout {
        &self.layout
    }

    pub fn route(&self, title: &str) -> Option<RouteMatch<'_>> {
        let title = fold_text(title);
        if title.is_empty() {
            return None;
        }
        self.routes
            .iter()
            .find(|route| title.contains(&route.keyword))
            .map(|route| RouteMatch {
                bucket: &route.bucket,
                sub_label: route.label.as_deref(),
            })
    }

    /// Catch-all key for an unrouted question: the title without a trailing
    /// question mark, cut to the configured length. Sub-label is the full title.
    /// `None` when nothing is left to key on.
    pub fn fold(&self, title: &str) -> Option<(String, String)> {
        let full = title.trim().to_string();
        let stripped = full.trim_end_matches('?').trim_end();
        let key: String = stripped.chars().take(self.fold_len).collect();
        let key = key.trim_end().to_string();
        (!key.is_empty()).then_some((key, full))
    }

    /// Placeholder answers that never enter a bucket.
    pub fn is_skip_value(&self, value: &str) -> bool {
        let value = fold_text(value);
        value.is_empty() || self.skip_values.contains(&value)
    }
}
