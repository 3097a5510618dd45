//! Network plumbing: connect, frame, pack and secure.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐   ┌──────────────┐
//! │  connector   │──▶│  GridStream   │──▶│    framer    │
//! │ (TcpStream)  │   │ plain | TLS   │   │ header+body  │
//! └──────────────┘   └───────────────┘   └──────┬───────┘
//!                           ▲                   │
//!                    ┌──────┴──────┐     ┌──────▼───────┐
//!                    │     tls     │     │     pack     │
//!                    └─────────────┘     └──────────────┘
//! ```

pub mod connector;
pub mod framer;
pub mod pack;
pub mod stream;
pub mod tls;

pub use connector::{attempt_connect, clamp_window_size, ConnectOptions};
pub use framer::{MessageBody, MsgHeader, MsgType};
pub use pack::{BinBytesBuf, PackReader, PackStruct, PackWriter};
pub use stream::GridStream;
pub use tls::{CertSource, TrustConfig};
