//! Line-delimited JSON protocol. One request object per line in, one reply
//! object per line out, with `{"event":...}` lines interleaved for LISTEN.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::LinesCodecError;
use ulid::Ulid;

use crate::engine::{BookingRequest, EngineError, PageDraft, ProductDraft, RuleDraft};
use crate::model::{BookingPage, Event, Ms, OverrideKind, Slot};

fn start_of_day() -> String {
    "00:00".into()
}

/// The override editor's default end: one minute short of midnight.
fn end_of_day() -> String {
    "23:59".into()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Auth {
        password: String,
    },
    Ping,

    CreatePage {
        owner_id: Ulid,
        page: PageDraft,
    },
    UpdatePage {
        id: Ulid,
        page: PageDraft,
    },
    SetPageLive {
        id: Ulid,
        live: bool,
    },
    DeletePage {
        id: Ulid,
    },
    SlugAvailable {
        slug: String,
        #[serde(default)]
        page_id: Option<Ulid>,
    },
    GetPage {
        id: Ulid,
    },
    ListPages {
        #[serde(default)]
        owner_id: Option<Ulid>,
    },

    AddProduct {
        page_id: Ulid,
        product: ProductDraft,
    },
    UpdateProduct {
        id: Ulid,
        product: ProductDraft,
    },
    SetProductActive {
        id: Ulid,
        active: bool,
    },
    RemoveProduct {
        id: Ulid,
    },
    ListProducts {
        page_id: Ulid,
    },

    AddRule {
        page_id: Ulid,
        rule: RuleDraft,
    },
    RemoveRule {
        id: Ulid,
    },
    ListRules {
        page_id: Ulid,
    },
    AddOverride {
        page_id: Ulid,
        date: NaiveDate,
        #[serde(default = "start_of_day")]
        start_time: String,
        #[serde(default = "end_of_day")]
        end_time: String,
        #[serde(default)]
        kind: OverrideKind,
    },
    RemoveOverride {
        id: Ulid,
    },
    ListOverrides {
        page_id: Ulid,
    },

    /// Public slot listing for a live page.
    Slots {
        slug: String,
        product_id: Ulid,
        /// First day of the window; today by the server's clock when absent.
        #[serde(default)]
        from: Option<NaiveDate>,
    },
    PlaceHold {
        page_id: Ulid,
        start: Ms,
        end: Ms,
    },
    ReleaseHold {
        id: Ulid,
    },
    RequestBooking {
        booking: BookingRequest,
    },
    AcceptBooking {
        id: Ulid,
    },
    DeclineBooking {
        id: Ulid,
    },
    CancelBooking {
        id: Ulid,
    },
    ListRequests {
        page_id: Ulid,
    },
    ListUpcoming {
        page_id: Ulid,
    },
    ListPast {
        page_id: Ulid,
    },

    Listen {
        page_id: Ulid,
    },
    Unlisten {
        page_id: Ulid,
    },
}

/// One reply line: `{"ok":true,"data":...}` or `{"ok":false,"code":...,"error":...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    pub fn ok(data: Value) -> Self {
        Self { ok: true, data: Some(data), code: None, error: None }
    }

    pub fn empty() -> Self {
        Self::ok(Value::Null)
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self { ok: false, data: None, code: Some(code.to_string()), error: Some(message.into()) }
    }

    /// Serialize `data`, or an `internal` error if that somehow fails.
    pub fn data<T: Serialize>(data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self::ok(value),
            Err(e) => Self::error("internal", e.to_string()),
        }
    }

    pub fn from_result<T: Serialize>(result: Result<T, EngineError>) -> Self {
        match result {
            Ok(data) => Self::data(&data),
            Err(e) => Self::error(e.code(), e.to_string()),
        }
    }

    pub fn status_label(&self) -> &str {
        if self.ok { "ok" } else { self.code.as_deref().unwrap_or("error") }
    }

    pub fn to_line(&self) -> String {
        // A struct of strings and JSON values always serializes.
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"ok":false,"code":"internal"}"#.into())
    }
}

/// Pushed to LISTEN subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub event: Event,
}

impl Notification {
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Parse(e.to_string()))
    }
}

/// Reply payload for `slots`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotListing {
    pub page: BookingPage,
    pub first_available_date: Option<String>,
    pub slots: Vec<Slot>,
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ProtocolError {
    Parse(String),
    TooLong,
    Unauthenticated,
    Io(std::io::Error),
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Parse(_) => "parse",
            ProtocolError::TooLong => "too_long",
            ProtocolError::Unauthenticated => "unauthenticated",
            ProtocolError::Io(_) => "io",
        }
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Parse(s) => write!(f, "parse error: {s}"),
            ProtocolError::TooLong => write!(f, "request line too long"),
            ProtocolError::Unauthenticated => write!(f, "authenticate first"),
            ProtocolError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtocolError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

impl From<LinesCodecError> for ProtocolError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::MaxLineLengthExceeded => ProtocolError::TooLong,
            LinesCodecError::Io(e) => ProtocolError::Io(e),
        }
    }
}

pub fn parse_request(line: &str) -> Result<Request, ProtocolError> {
    serde_json::from_str(line.trim()).map_err(|e| ProtocolError::Parse(e.to_string()))
}
