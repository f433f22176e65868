//! URL routing: `<name>` segments captured into [`MatchInfo`].

use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::view::View;

pub type ViewFactory = Arc<dyn Fn() -> Arc<dyn View> + Send + Sync>;

pub struct Route {
    pub name: String,
    pub pattern: String,
    pub multi_user: bool,
    regex: Regex,
    factory: ViewFactory,
}

impl Route {
    pub fn new<F>(name: &str, pattern: &str, factory: F) -> Result<Self, regex::Error>
    where
        F: Fn() -> Arc<dyn View> + Send + Sync + 'static,
    {
        Ok(Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
            multi_user: false,
            regex: compile_pattern(pattern)?,
            factory: Arc::new(factory),
        })
    }

    /// One runtime shared by every user.
    pub fn multi_user(mut self) -> Self {
        self.multi_user = true;
        self
    }

    pub fn build_view(&self) -> Arc<dyn View> {
        (self.factory)()
    }

    pub fn matches(&self, path: &str) -> Option<MatchInfo> {
        let caps = self.regex.captures(path)?;
        let args = self
            .regex
            .capture_names()
            .flatten()
            .filter_map(|name| caps.name(name).map(|m| (name.to_string(), m.as_str().to_string())))
            .collect();
        Some(MatchInfo {
            route: self.name.clone(),
            path: path.to_string(),
            args,
        })
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("name", &self.name)
            .field("pattern", &self.pattern)
            .field("multi_user", &self.multi_user)
            .finish()
    }
}

/// `/room/<id>/` -> `^/room/(?P<id>[^/]+)/?$`. Trailing slashes are optional.
fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    let mut out = String::from("^");
    let trimmed = pattern.trim_end_matches('/');
    let mut rest = trimmed;
    while let Some(start) = rest.find('<') {
        out.push_str(&regex::escape(&rest[..start]));
        let Some(end) = rest[start..].find('>') else {
            break;
        };
        let name = &rest[start + 1..start + end];
        out.push_str(&format!("(?P<{}>[^/]+)", name));
        rest = &rest[start + end + 1..];
    }
    out.push_str(&regex::escape(rest));
    out.push_str("/?$");
    Regex::new(&out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchInfo {
    pub route: String,
    pub path: String,
    pub args: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct Router {
    routes: Vec<Arc<Route>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, route: Route) -> &mut Self {
        self.routes.push(Arc::new(route));
        self
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    /// First matching route. Query strings and fragments are ignored.
    pub fn resolve(&self, url: &str) -> Option<(Arc<Route>, MatchInfo)> {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let path = if path.is_empty() { "/" } else { path };
        self.routes
            .iter()
            .find_map(|route| route.matches(path).map(|info| (route.clone(), info)))
    }
}
