//! # paywatch
//!
//! On-chain stablecoin payment watcher for subscription billing.
//!
//! A payment flows through three stages:
//!
//! 1. **Intent**: the caller commits to an amount and subscription and
//!    receives a salted message for the wallet to sign.
//! 2. **Settlement**: a stablecoin transfer to the receiver wallet is
//!    observed, either live by the [`payment::TransferListener`],
//!    retroactively by the [`payment::ReconciliationCrawler`], or through
//!    direct verification of a submitted transaction hash.
//! 3. **Activation**: the verified payment settles exactly once and
//!    activates its subscription.
//!
//! ```no_run
//! use paywatch::{NodeBuilder, NodeConfig};
//!
//! # async fn example() -> paywatch::Result<()> {
//! let config = NodeConfig::from_file(std::path::Path::new("paywatch.toml"))?;
//! let node = NodeBuilder::new(config).build()?;
//! node.run().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod chain;
pub mod config;
pub mod error;
pub mod node;
pub mod payment;
pub mod subscription;

pub use config::NodeConfig;
pub use error::{Error, Result, VerificationFailure};
pub use node::{NodeBuilder, RunningNode};
pub use payment::{PaymentService, PaymentStatus};
pub use subscription::{Plan, Subscription, SubscriptionStatus};
