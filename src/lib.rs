//! # imux - TCP Inverse Multiplexing Library
//!
//! imux splits the byte stream of a TCP connection into fixed-size chunks,
//! fans the chunks out across a pool of independent links, and reassembles
//! them in order on the far side before writing them to a destination
//! socket. Both endpoints keep ordinary TCP semantics.
//!
//! ## Key Features
//!
//! - **Throughput Aggregation**: A single stream uses every link of the pool
//!   at once
//! - **Order Restoration**: Every chunk carries a per-socket sequence number,
//!   so links may deliver in any order
//! - **At-least-once Tolerance**: Duplicated chunks are discarded on arrival
//! - **Both Directions**: Bytes sent back by the destination travel the same
//!   way in reverse
//! - **Contained Failures**: A failing socket or link only takes itself down
//!
//! ## How It Works
//!
//! ```text
//! client -> one_to_many -> ConnectionPool ==N links==> ManyToOne -> WriteQueue -> destination
//! ```
//!
//! [`one_to_many`] accepts source connections, gives each a random
//! [`SocketId`] and reads it in chunks of [`PoolConfig::chunk_size`] bytes.
//! The [`ConnectionPool`] sends every chunk over whichever link is free.
//! [`ManyToOne`] receives chunks from all links, keeps one [`WriteQueue`]
//! per socket in a [`WriteQueueRegistry`] and writes reordered bytes to a
//! fresh connection to the destination.
//!
//! ## Basic Usage
//!
//! ### Egress Side
//!
//! ```rust,no_run
//! use imux::{Acceptor, ManyToOne, PoolConfig};
//!
//! let links = Acceptor::bind("0.0.0.0:9001")?;
//! let egress = ManyToOne::new("127.0.0.1:22", PoolConfig::default())?;
//! egress.serve(&links)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Ingress Side
//!
//! ```rust,no_run
//! use imux::{Acceptor, ConnectionPool, PoolConfig, one_to_many};
//!
//! // Four links to the egress side
//! let pool = ConnectionPool::connect("egress.example:9001", 4, PoolConfig::default())?;
//! let listener = Acceptor::bind("127.0.0.1:2222")?;
//! one_to_many(&listener, &pool)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Configuration
//!
//! [`PoolConfig`] fixes the chunk size, the outgoing queue capacity, the
//! policy applied when every link is gone ([`ExhaustedPolicy`]) and the
//! number of bytes a reassembly queue may hold behind a missing chunk. Both
//! sides should use the same chunk size.
//!
//! ## Shutdown
//!
//! Accept loops stop through the [`ShutdownHandle`] of their [`Acceptor`].
//! [`ConnectionPool::shutdown`] and [`ManyToOne::shutdown`] close every
//! owned socket so that pending reads return.

#![warn(missing_docs)]

mod chunk;
mod error;
pub mod link;
mod listener;
mod many_to_one;
mod one_to_many;
mod pool;
mod queue;
mod registry;
mod write_queue;

pub use chunk::{Chunk, Message, SocketId};
pub use error::{PoolError, WriteError};
pub use listener::{Acceptor, ShutdownHandle};
pub use many_to_one::{ManyToOne, many_to_one};
pub use one_to_many::{Chunker, forward, one_to_many};
pub use pool::{ConnectionPool, ExhaustedPolicy, MAX_CHUNK_SIZE, PoolConfig};
pub use registry::{Delivery, WriteQueueRegistry};
pub use write_queue::{Destination, Progress, WriteQueue};
