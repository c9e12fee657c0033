/// What the keepalive ticker should do this tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Beat {
    SendPing,
    Terminate,
    /// Already terminated; nothing more to do.
    Idle,
}

/// Ping/pong bookkeeping for one socket.
#[derive(Debug, Default)]
pub struct Heartbeat {
    awaiting_pong: bool,
    terminated: bool,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called on each interval tick. A ping still unanswered at the next tick
    /// terminates the connection, once.
    pub fn on_tick(&mut self) -> Beat {
        if self.terminated {
            return Beat::Idle;
        }
        if self.awaiting_pong {
            self.terminated = true;
            return Beat::Terminate;
        }
        self.awaiting_pong = true;
        Beat::SendPing
    }

    /// Returns true when this pong answers an outstanding ping.
    pub fn on_pong(&mut self) -> bool {
        if self.terminated || !self.awaiting_pong {
            return false;
        }
        self.awaiting_pong = false;
        true
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}
