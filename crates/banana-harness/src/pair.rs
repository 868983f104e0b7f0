//! Two brokers connected back to back in memory.

use std::sync::Arc;

use banana_pb::{Broker, BrokerAction, BrokerConfig, Referenceable};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

/// How bytes are cut before delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunking {
    /// Each write is delivered in one piece
    Whole,
    /// Pieces of exactly this many bytes (the last may be shorter)
    Fixed(usize),
    /// Pieces of 1 to `max` bytes drawn from the pair's seeded RNG
    Random {
        /// Largest piece
        max: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

/// A client broker and a server broker joined by an in-memory pipe.
///
/// Nothing moves until [`BrokerPair::settle`]; every byte each side writes
/// is also kept so tests can decode it with [`crate::decode_messages`].
pub struct BrokerPair {
    client: Broker,
    server: Broker,
    chunking: Chunking,
    rng: ChaCha8Rng,
    client_wire: Vec<u8>,
    server_wire: Vec<u8>,
    lost: Option<String>,
}

impl BrokerPair {
    /// Pair with default configuration on both sides.
    pub fn new(client_root: Arc<dyn Referenceable>, server_root: Arc<dyn Referenceable>) -> Self {
        Self::with_config(BrokerConfig::default(), client_root, BrokerConfig::default(), server_root)
    }

    /// Pair with explicit configuration.
    pub fn with_config(
        client_config: BrokerConfig,
        client_root: Arc<dyn Referenceable>,
        server_config: BrokerConfig,
        server_root: Arc<dyn Referenceable>,
    ) -> Self {
        Self {
            client: Broker::new(client_config, client_root),
            server: Broker::new(server_config, server_root),
            chunking: Chunking::Whole,
            rng: ChaCha8Rng::seed_from_u64(0),
            client_wire: Vec::new(),
            server_wire: Vec::new(),
            lost: None,
        }
    }

    /// Cut deliveries according to `chunking`.
    #[must_use]
    pub fn chunking(mut self, chunking: Chunking) -> Self {
        self.chunking = chunking;
        self
    }

    /// Seed the RNG used by [`Chunking::Random`].
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    /// The calling side.
    pub fn client(&mut self) -> &mut Broker {
        &mut self.client
    }

    /// The serving side.
    pub fn server(&mut self) -> &mut Broker {
        &mut self.server
    }

    /// Everything the client has written.
    pub fn client_wire(&self) -> &[u8] {
        &self.client_wire
    }

    /// Everything the server has written.
    pub fn server_wire(&self) -> &[u8] {
        &self.server_wire
    }

    /// Why the connection was dropped, if a side asked to drop it.
    pub fn lost(&self) -> Option<&str> {
        self.lost.as_deref()
    }

    /// Exchange bytes until neither side has anything left to write.
    ///
    /// Returns the number of delivery rounds.
    pub fn settle(&mut self) -> usize {
        let actions = self.client.flush();
        let mut to_server = self.absorb(Side::Client, actions);
        let actions = self.server.flush();
        let mut to_client = self.absorb(Side::Server, actions);
        let mut rounds = 0;
        while !to_server.is_empty() || !to_client.is_empty() {
            rounds += 1;
            let from_server = self.deliver(Side::Server, &to_server);
            let from_client = self.deliver(Side::Client, &to_client);
            to_server = from_client;
            to_client = from_server;
        }
        debug!(rounds, "pair settled");
        rounds
    }

    /// Drop the connection under both brokers.
    pub fn disconnect(&mut self, reason: &str) {
        self.client.connection_lost(reason);
        self.server.connection_lost(reason);
        self.lost.get_or_insert_with(|| reason.to_string());
    }

    fn broker(&mut self, side: Side) -> &mut Broker {
        match side {
            Side::Client => &mut self.client,
            Side::Server => &mut self.server,
        }
    }

    /// Feed `data` to `to`, returning what it wrote in response.
    fn deliver(&mut self, to: Side, data: &[u8]) -> Vec<u8> {
        let mut replies = Vec::new();
        for chunk in self.chunks(data) {
            let actions = self.broker(to).data_received(&chunk);
            replies.extend(self.absorb(to, actions));
        }
        replies
    }

    fn chunks(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        if data.is_empty() {
            return Vec::new();
        }
        match self.chunking {
            Chunking::Whole => vec![data.to_vec()],
            Chunking::Fixed(size) => data.chunks(size.max(1)).map(<[u8]>::to_vec).collect(),
            Chunking::Random { max } => {
                let mut pieces = Vec::new();
                let mut rest = data;
                while !rest.is_empty() {
                    let take = self.rng.gen_range(1..=max.max(1)).min(rest.len());
                    let (piece, tail) = rest.split_at(take);
                    pieces.push(piece.to_vec());
                    rest = tail;
                }
                pieces
            },
        }
    }

    fn absorb(&mut self, from: Side, actions: Vec<BrokerAction>) -> Vec<u8> {
        let mut written = Vec::new();
        for action in actions {
            match action {
                BrokerAction::Write(bytes) => written.extend_from_slice(&bytes),
                BrokerAction::LoseConnection { reason } => {
                    debug!(?from, %reason, "side dropped the connection");
                    self.disconnect(&reason);
                },
            }
        }
        match from {
            Side::Client => self.client_wire.extend_from_slice(&written),
            Side::Server => self.server_wire.extend_from_slice(&written),
        }
        written
    }
}
