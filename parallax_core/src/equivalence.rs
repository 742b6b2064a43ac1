use std::sync::{Arc, Condvar, Mutex};

/// Byte-array exchange contract for cross-process equivalence checking.
///
/// A session is either a client or a server (or neither, when the feature
/// is off). The client ships every input before execution and, once the
/// target announced its output, posts, waits for the server's output and
/// compares. The real backing store (shared memory between two processes)
/// is an external collaborator; this crate only consumes the contract.
pub trait EquivalenceChannel: Send {
    fn is_client(&self) -> bool;
    fn is_server(&self) -> bool;
    /// Publishes a byte array to the peer.
    fn write_bytes(&mut self, data: &[u8]);
    /// Client only: signals the peer that an output is ready.
    fn post_client(&mut self);
    /// Client only: blocks until the server published its output.
    fn wait_server(&mut self);
    /// Reads the peer's most recent byte array.
    fn read_bytes(&mut self) -> Vec<u8>;
}

/// A disagreement between the two sides of an equivalence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    /// First differing offset (== the common length when one output is a
    /// prefix of the other).
    pub offset: usize,
    pub our_size: usize,
    pub their_size: usize,
}

/// Compares the two outputs; `None` means they agree byte for byte.
pub fn compare_outputs(ours: &[u8], theirs: &[u8]) -> Option<Mismatch> {
    if ours == theirs {
        return None;
    }
    let common = ours.len().min(theirs.len());
    let offset = (0..common)
        .find(|&i| ours[i] != theirs[i])
        .unwrap_or(common);
    Some(Mismatch {
        offset,
        our_size: ours.len(),
        their_size: theirs.len(),
    })
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

#[derive(Default)]
struct PairState {
    client_box: Option<Vec<u8>>,
    server_box: Option<Vec<u8>>,
    client_posted: bool,
}

/// In-process channel pair implementing the contract; stands in for the
/// shared-memory region when both sides live in one process (tests, local
/// two-thread equivalence runs).
pub struct PairChannel {
    role: Role,
    shared: Arc<(Mutex<PairState>, Condvar)>,
}

impl PairChannel {
    /// Server side: whether the client has posted since the last check.
    pub fn client_has_posted(&self) -> bool {
        let (state, _) = &*self.shared;
        state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .client_posted
    }
}

/// Creates a connected (client, server) pair.
pub fn pair() -> (PairChannel, PairChannel) {
    let shared = Arc::new((Mutex::new(PairState::default()), Condvar::new()));
    (
        PairChannel {
            role: Role::Client,
            shared: Arc::clone(&shared),
        },
        PairChannel {
            role: Role::Server,
            shared,
        },
    )
}

impl EquivalenceChannel for PairChannel {
    fn is_client(&self) -> bool {
        self.role == Role::Client
    }

    fn is_server(&self) -> bool {
        self.role == Role::Server
    }

    fn write_bytes(&mut self, data: &[u8]) {
        let (state, cond) = &*self.shared;
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        match self.role {
            Role::Client => state.client_box = Some(data.to_vec()),
            Role::Server => state.server_box = Some(data.to_vec()),
        }
        cond.notify_all();
    }

    fn post_client(&mut self) {
        let (state, cond) = &*self.shared;
        state.lock().unwrap_or_else(|e| e.into_inner()).client_posted = true;
        cond.notify_all();
    }

    fn wait_server(&mut self) {
        let (state, cond) = &*self.shared;
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        while state.server_box.is_none() {
            state = cond.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    fn read_bytes(&mut self) -> Vec<u8> {
        let (state, _) = &*self.shared;
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        match self.role {
            Role::Client => state.server_box.take(),
            Role::Server => state.client_box.take(),
        }
        .unwrap_or_default()
    }
}
