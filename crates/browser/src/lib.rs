//! Chromium automation layer: DevTools client, browser lifecycle,
//! hosted-page driving, request interception and page instrumentation.

pub mod cdp;
pub mod chrome;
pub mod instrument;
pub mod intercept;
pub mod studio;

pub use cdp::CdpClient;
pub use chrome::{find_browser_binary, BrowserSession};
pub use instrument::{challenge_observer, InstrumentEvent, InstrumentRegistry, PageInstrument};
pub use intercept::Interceptor;
pub use studio::{SendButtonState, StudioPage, StudioSurface, PROBE_TEXT, TARGET_MARKER, TARGET_URL};
