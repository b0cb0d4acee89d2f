use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;

use super::{Interactor, VisitError};
use crate::models::InteractionKind;

/// Callback that hands a visit URL to a person, e.g. by launching a browser.
pub type OpenBrowser = Arc<dyn Fn(&Url) -> Result<(), VisitError> + Send + Sync>;

enum Driver {
    Open(OpenBrowser),
    Password {
        username: String,
        password: SecretString,
    },
}

/// Drives the browser-redirect interaction.
pub struct WebBrowserVisitor {
    driver: Driver,
}

impl WebBrowserVisitor {
    /// Hand the URL to a person and return. The outcome arrives on the wait
    /// endpoint.
    pub fn new(open: OpenBrowser) -> Self {
        Self {
            driver: Driver::Open(open),
        }
    }

    /// Fill in the login page as a browser would.
    pub fn password_login(username: impl Into<String>, password: SecretString) -> Self {
        Self {
            driver: Driver::Password {
                username: username.into(),
                password,
            },
        }
    }
}

#[async_trait]
impl Interactor for WebBrowserVisitor {
    fn kind(&self) -> InteractionKind {
        InteractionKind::BrowserRedirect
    }

    async fn interact(&self, client: &reqwest::Client, visit_url: &Url) -> Result<(), VisitError> {
        match &self.driver {
            Driver::Open(open) => open(visit_url),
            Driver::Password { username, password } => {
                let page = client.get(visit_url.clone()).send().await?;
                if !page.status().is_success() {
                    return Err(VisitError::Other(format!(
                        "login page returned {}",
                        page.status()
                    )));
                }

                let response = client
                    .post(visit_url.clone())
                    .form(&[
                        ("username", username.as_str()),
                        ("password", password.expose_secret().as_str()),
                    ])
                    .send()
                    .await?;
                // A rejected password is reported through the wait endpoint.
                match response.status() {
                    s if s.is_success() || s == StatusCode::UNAUTHORIZED => Ok(()),
                    s => Err(VisitError::Other(format!("login form returned {}", s))),
                }
            }
        }
    }
}

/// Posts username and password straight to the form endpoint.
pub struct LegacyFormVisitor {
    username: String,
    password: SecretString,
}

impl LegacyFormVisitor {
    pub fn new(username: impl Into<String>, password: SecretString) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }
}

#[async_trait]
impl Interactor for LegacyFormVisitor {
    fn kind(&self) -> InteractionKind {
        InteractionKind::LegacyForm
    }

    async fn interact(&self, client: &reqwest::Client, visit_url: &Url) -> Result<(), VisitError> {
        let response = client
            .post(visit_url.clone())
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.expose_secret().as_str()),
            ])
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(VisitError::from_response(response).await)
    }
}
