//! Tenant connection and authentication core
//!
//! This crate turns one of several credential inputs into a reusable
//! [`Session`] that downstream code uses to call a tenant's document-platform
//! API and the directory graph API.
//!
//! # Connection Flow
//!
//! 1. Resolve the client certificate, if the credentials are certificate based
//! 2. Discover the tenant realm from the site, if an app secret came without one
//! 3. Acquire a token through the matching [`Flow`]
//! 4. Build the [`Session`] and classify it (ordinary or tenant admin site)
//! 5. Register it with the [`SessionRegistry`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use spc_auth::{
//!     Audience, ConnectConfig, ConnectRequest, Connector, Credentials, Permissions,
//!     Registration, SessionRegistry,
//! };
//! use url::Url;
//! use zeroize::Zeroizing;
//!
//! # async fn example() -> spc_auth::Result<()> {
//! let registry = Arc::new(SessionRegistry::new());
//! let connector = Connector::new(ConnectConfig::default(), registry.clone())?;
//!
//! let request = ConnectRequest::new(
//!     Url::parse("https://contoso.sharepoint.com/sites/team")?,
//!     Credentials::AppSecret {
//!         client_id: "00000000-0000-0000-0000-000000000000".to_string(),
//!         client_secret: Zeroizing::new("secret".to_string()),
//!         realm: None,
//!     },
//! );
//! let session = connector
//!     .connect(request, Registration::MakeCurrent)
//!     .await?
//!     .expect("app secret logins always produce a session");
//!
//! // Downstream calls pull tokens through the session
//! let bearer = session
//!     .bearer_header(Audience::DocumentPlatform, &Permissions::Bypass)
//!     .await?;
//! println!("{:?} session, {} byte bearer", session.classification(), bearer.len());
//!
//! registry.clear().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Permission Requirements
//!
//! ```
//! use spc_auth::{PermissionRequirements, Permissions};
//!
//! let required = PermissionRequirements::all_of(["Group.Read.All"]);
//! assert_eq!(
//!     required.missing(&["User.Read".to_string()]),
//!     vec!["Group.Read.All".to_string()]
//! );
//!
//! // Opting out skips both requirement sets
//! let _ = Permissions::Bypass;
//! ```
//!
//! # Sessions Without a Current Connection
//!
//! ```
//! use spc_auth::{ScAuthError, SessionRegistry};
//!
//! # async fn example() {
//! let registry = SessionRegistry::new();
//! assert!(matches!(registry.resolve(None), Err(ScAuthError::NoConnection)));
//! assert!(!registry.disconnect().await.unwrap());
//! # }
//! # tokio_test::block_on(example());
//! ```
//!
//! # Important Notes
//!
//! - Only transport failures are worth retrying, see [`ScAuthError::is_retryable`]
//! - Tokens, secrets and passwords are redacted from `Debug` output and never logged
//! - Certificates loaded from a file have their cached key material removed on teardown

pub mod broker;
pub mod browser;
pub mod cache;
pub mod certificate;
pub mod cleanup;
pub mod config;
pub mod connector;
pub mod device;
pub mod errors;
pub mod models;
pub mod realm;
pub mod registry;
pub mod session;

// Re-export main types
pub use broker::{Acquired, Flow, TokenBroker, TokenGrant};
pub use browser::{WebLoginContext, WebLoginSurface};
pub use cache::{PermissionRequirements, Permissions};
pub use certificate::{Certificate, CertificateSource, CertificateStore, DirectoryCertificateStore};
pub use cleanup::cleanup_machine_key;
pub use config::{ConnectConfig, Environment, PasswordFallback};
pub use connector::{ConnectRequest, Connector, Credentials};
pub use device::{DeviceCodeCallback, DeviceCodePrompt};
pub use errors::{ConsentGuidance, ErrorKind, Result, ScAuthError};
pub use realm::discover_realm;
pub use registry::{Registration, SessionRegistry};
pub use session::{Audience, Classification, Provenance, Session, Token, TransportCredentials};
