//! HTTP handlers for the discharge service.

pub mod discharge;
pub mod login;
pub mod metrics;
pub mod wait;

pub use discharge::discharge;
pub use login::{
    browser_login, browser_login_page, legacy_agent_login, legacy_form_login, login_methods,
    signed_login,
};
pub use wait::wait;
