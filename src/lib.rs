//! Distributed DataFrame access over Arrow Flight.
//!
//! A [`DataFrame`] records transformations as an action log and runs it
//! either against resident data or on a dacp server that holds the source
//! files. Both paths go through the same [`interpreter`].
//!
//! ```no_run
//! # async fn demo() -> dacp::Result<()> {
//! use dacp::{Credentials, DacpClient};
//!
//! let client = DacpClient::connect("dacp://localhost:3101", Credentials::Anonymous).await?;
//! let df = client.open("dacp://localhost:3101/ocean/temps.csv").await?;
//! let warm = df.filter("temp > 20").select(["station", "temp"]).limit(100);
//! println!("{}", warm.to_string_with(&Default::default()).await?);
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod client;
pub mod config;
pub mod dataframe;
pub mod error;
pub mod error_display;
pub mod expr;
pub mod format;
pub mod interpreter;
pub mod local;
pub mod logging;
pub mod parser;
pub mod protocol;
pub mod server;
pub mod table;
pub mod uri;

pub use action::{Action, MapFunction, SortOrder};
pub use client::{DacpClient, FrameInfo};
pub use config::{AppConfig, ConfigManager, APP_NAME};
pub use dataframe::DataFrame;
pub use error::{Error, Result};
pub use format::DisplayOptions;
pub use parser::FileFormat;
pub use protocol::Credentials;
pub use server::{start_server, ServerState};
pub use table::Table;
pub use uri::DataframeUri;
