use accesskit::Action;
use thiserror::Error;

/// Wire error codes used by the RPC layer.
///
/// The set is closed: drivers switch on these numbers, so new failure modes
/// must map onto an existing code rather than extend the table.
pub mod codes {
    pub const ELEMENT_NOT_FOUND: i64 = 100;
    pub const CAPTURE_UNAVAILABLE: i64 = 101;
    pub const ELEMENT_NOT_INTERACTABLE: i64 = 102;
    pub const SELECTOR_PARSE_ERROR: i64 = 103;
    pub const SELECTOR_REQUIRED: i64 = 104;
    pub const ACTION_NOT_SUPPORTED: i64 = 105;
    pub const INSPECTION_ERROR: i64 = 300;
    pub const WIDGET_ACCESS_ERROR: i64 = 400;
    pub const MALFORMED_REQUEST: i64 = -32600;
    pub const UNKNOWN_METHOD: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
}

/// Everything that can go wrong between a driver request and its response.
///
/// Handlers catch these at the RPC boundary and turn them into structured
/// error responses; nothing in here ever crashes the host application.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The selector parsed but matched no element in the current snapshot.
    #[error("no element matches selector `{0}`")]
    ElementNotFound(String),

    /// The target element has no actionable capability or is invisible.
    #[error("element `{0}` is not interactable")]
    ElementNotInteractable(String),

    /// The selector string is syntactically invalid.
    #[error("selector parse error at offset {offset}: {message}")]
    SelectorParse { offset: usize, message: String },

    /// The method requires a `selector` parameter and none was supplied.
    #[error("a selector is required for this method")]
    SelectorRequired,

    /// The accessibility node does not declare the requested action.
    #[error("accessibility action {0:?} is not supported by the target node")]
    ActionNotSupported(Action),

    /// No repaint boundary was reachable for rendering.
    #[error("screenshot capture unavailable: {0}")]
    CaptureUnavailable(String),

    /// A host inspection capability threw or is unavailable.
    #[error("host inspection failed: {0}")]
    Inspection(String),

    /// A registered widget capability (or the text channel) failed.
    #[error("widget access failed: {0}")]
    WidgetAccess(String),

    /// The request frame was not a valid request object.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// The request named a method the server does not implement.
    #[error("unknown method `{0}`")]
    UnknownMethod(String),

    /// The request parameters were missing or of the wrong shape.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
}

impl AgentError {
    /// The wire code for this error.
    pub fn code(&self) -> i64 {
        match self {
            AgentError::ElementNotFound(_) => codes::ELEMENT_NOT_FOUND,
            AgentError::ElementNotInteractable(_) => codes::ELEMENT_NOT_INTERACTABLE,
            AgentError::SelectorParse { .. } => codes::SELECTOR_PARSE_ERROR,
            AgentError::SelectorRequired => codes::SELECTOR_REQUIRED,
            AgentError::ActionNotSupported(_) => codes::ACTION_NOT_SUPPORTED,
            AgentError::CaptureUnavailable(_) => codes::CAPTURE_UNAVAILABLE,
            AgentError::Inspection(_) => codes::INSPECTION_ERROR,
            AgentError::WidgetAccess(_) => codes::WIDGET_ACCESS_ERROR,
            AgentError::MalformedRequest(_) => codes::MALFORMED_REQUEST,
            AgentError::UnknownMethod(_) => codes::UNKNOWN_METHOD,
            AgentError::InvalidParams(_) => codes::INVALID_PARAMS,
        }
    }

    /// Extra payload attached to the error response, when the error carries
    /// context a driver can act on (e.g. the parse offset).
    pub fn data(&self) -> Option<serde_json::Value> {
        match self {
            AgentError::SelectorParse { offset, .. } => {
                Some(serde_json::json!({ "offset": offset }))
            }
            AgentError::ElementNotFound(selector) => {
                Some(serde_json::json!({ "selector": selector }))
            }
            _ => None,
        }
    }
}
