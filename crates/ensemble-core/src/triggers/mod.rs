//! External triggers: GitHub webhooks and the polling fallback.
//!
//! Both paths converge on the same matcher/prompter: a webhook delivery is
//! verified then matched; a polled Events-API entry is converted to the
//! webhook payload shape and matched the same way.

pub mod github;
pub mod polling;
pub mod webhook;

pub use github::GithubHooksClient;
pub use polling::{GithubPoller, PollerConfig};
pub use webhook::WebhookReceiver;
