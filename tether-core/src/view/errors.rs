//! 404 / 500 rendering with a hard-coded fallback behind each handler.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tether_html::{tags, Node};

use super::{Request, View, ViewHandle};
use crate::error::{ViewError, ViewResult};

pub type ErrorHandler = Arc<dyn Fn(&Request, Option<&str>) -> Result<Node, ViewError> + Send + Sync>;

#[derive(Clone)]
pub struct ErrorHandlers {
    pub not_found: ErrorHandler,
    pub internal_error: ErrorHandler,
}

impl Default for ErrorHandlers {
    fn default() -> Self {
        Self {
            not_found: Arc::new(|request: &Request, _: Option<&str>| Ok(fallback_not_found(request))),
            internal_error: Arc::new(|request: &Request, message: Option<&str>| Ok(fallback_internal_error(request, message))),
        }
    }
}

pub fn fallback_not_found(request: &Request) -> Node {
    tags::div().with_text(format!("404 Not Found: {}", request.url))
}

pub fn fallback_internal_error(_request: &Request, _message: Option<&str>) -> Node {
    tags::div().with_text("500 Internal Error")
}

/// Run `handler`, falling back to `fallback` on an error or a panic.
pub(crate) fn render_with_fallback(
    handler: &ErrorHandler,
    fallback: fn(&Request, Option<&str>) -> Node,
    request: &Request,
    message: Option<&str>,
) -> Node {
    match catch_unwind(AssertUnwindSafe(|| handler(request, message))) {
        Ok(Ok(node)) => node,
        Ok(Err(e)) => {
            tracing::error!(target: "view", url = %request.url, error = %e, "error handler failed, using fallback");
            fallback(request, message)
        }
        Err(_) => {
            tracing::error!(target: "view", url = %request.url, "error handler panicked, using fallback");
            fallback(request, message)
        }
    }
}

/// The view started for URLs no route matches.
pub(crate) struct NotFoundView {
    pub handlers: ErrorHandlers,
}

impl View for NotFoundView {
    fn handle_request(&self, view: &ViewHandle, request: &Request) -> ViewResult {
        let node = render_with_fallback(
            &self.handlers.not_found,
            |request, _| fallback_not_found(request),
            request,
            None,
        );
        view.set_title("404");
        view.show(Some(&node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::MatchInfo;
    use std::collections::HashMap;

    fn request() -> Request {
        Request {
            url: "/nope/".to_string(),
            user: "alice".to_string(),
            post_data: None,
            match_info: MatchInfo {
                route: String::new(),
                path: "/nope/".to_string(),
                args: HashMap::new(),
            },
        }
    }

    #[test]
    fn test_failing_handler_uses_fallback() {
        let failing: ErrorHandler = Arc::new(|_: &Request, _: Option<&str>| Err(ViewError::custom("broken")));
        let node = render_with_fallback(&failing, fallback_internal_error, &request(), Some("x"));
        assert_eq!(node.get_text(), "500 Internal Error");

        let panicking: ErrorHandler = Arc::new(|_: &Request, _: Option<&str>| -> Result<Node, ViewError> { panic!("handler panic") });
        let node = render_with_fallback(&panicking, fallback_internal_error, &request(), None);
        assert_eq!(node.get_text(), "500 Internal Error");
    }

    #[test]
    fn test_fallback_not_found_mentions_url() {
        assert!(fallback_not_found(&request()).get_text().contains("/nope/"));
    }
}
