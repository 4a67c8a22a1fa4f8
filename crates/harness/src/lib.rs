//! uiverify - browser-driven verification harness
//!
//! Runs declarative UI scenarios against a web application in a real
//! Chromium instance:
//! - Serves the application locally for the duration of a run (optional)
//! - Opens an isolated browser session per scenario
//! - Executes steps through an interaction driver with bounded retries
//! - Waits and asserts by polling page state
//! - Captures a screenshot and the console log when something fails
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ScenarioRunner                                             │
//! │    ├── ServerHandle (target process, PortLease)             │
//! │    ├── BrowserEngine::open() -> Session -> Page             │
//! │    ├── Driver   navigate / click / fill / select / evaluate │
//! │    ├── Waiter   selector states, predicates, sleep          │
//! │    ├── Asserter expectations, polled until timeout          │
//! │    └── Diagnostics failure.png + events.log                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Scenario (YAML)                                            │
//! │    ├── name, serve | base_url, viewport, timeouts           │
//! │    └── setup / steps / teardown: [Step]                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod artifact;
pub mod browser;
pub mod cdp;
pub mod config;
pub mod diagnostics;
pub mod driver;
pub mod error;
pub mod events;
pub mod expect;
pub mod page;
pub mod runner;
pub mod scenario;
pub mod selector;
pub mod server;
pub mod wait;

pub use artifact::{Artifact, ArtifactSink};
pub use browser::{BrowserEngine, ChromiumEngine, Session, SessionConfig, Viewport};
pub use config::{HarnessConfig, Timeouts};
pub use error::{HarnessError, HarnessResult};
pub use events::EventLog;
pub use expect::{Check, Expectation};
pub use page::{ElementState, Page, WaitState};
pub use runner::{RunReport, RunStatus, ScenarioRunner, SuiteReport};
pub use scenario::{Scenario, Step};
pub use selector::Selector;
