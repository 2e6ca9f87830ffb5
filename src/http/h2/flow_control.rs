//! HTTP/2 flow control
//!
//! This module implements flow control as defined in RFC 7540 Section 5.2.
//!
//! Every stream and the connection itself carry a pair of windows: the send
//! window (how much DATA the peer still accepts from us) and the receive
//! window (how much DATA we still accept from the peer).

use super::error::{Error, Result};
use super::settings::MAX_WINDOW_SIZE;
use super::DEFAULT_INITIAL_WINDOW_SIZE;

/// Flow control window
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    initial_size: u32,
    /// Can go negative after a SETTINGS_INITIAL_WINDOW_SIZE decrease
    current_size: i64,
}

impl FlowControlWindow {
    pub fn with_initial_size(initial_size: u32) -> Self {
        FlowControlWindow {
            initial_size,
            current_size: initial_size as i64,
        }
    }

    pub fn size(&self) -> i64 {
        self.current_size
    }

    pub fn initial_size(&self) -> u32 {
        self.initial_size
    }

    /// Bytes that may be sent right now
    pub fn available(&self) -> usize {
        self.current_size.max(0) as usize
    }

    /// Take up to `amount` bytes of capacity, returning what was taken
    pub fn consume(&mut self, amount: usize) -> usize {
        let taken = amount.min(self.available());
        self.current_size -= taken as i64;
        taken
    }

    /// Account for `amount` bytes the peer sent us
    ///
    /// A peer that overruns our window is a flow-control violation.
    pub fn receive(&mut self, amount: usize) -> Result<()> {
        if amount as i64 > self.current_size {
            return Err(Error::FlowControl(format!(
                "Peer sent {} bytes with only {} bytes of window",
                amount, self.current_size
            )));
        }
        self.current_size -= amount as i64;
        Ok(())
    }

    /// Increase window size (WINDOW_UPDATE)
    pub fn increase(&mut self, increment: u32) -> Result<i64> {
        if increment == 0 {
            return Err(Error::Protocol("WINDOW_UPDATE increment must be non-zero".to_string()));
        }

        let new_size = self.current_size + increment as i64;

        // RFC 7540 Section 6.9.1
        if new_size > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!("Window size {} exceeds maximum (2^31-1)", new_size)));
        }

        self.current_size = new_size;
        Ok(self.current_size)
    }

    /// Apply a new SETTINGS_INITIAL_WINDOW_SIZE (RFC 7540 Section 6.9.2)
    pub fn update_initial_size(&mut self, new_initial_size: u32) -> Result<()> {
        let new_current = self.current_size + new_initial_size as i64 - self.initial_size as i64;

        if new_current > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!(
                "New window size {} exceeds maximum (2^31-1)",
                new_current
            )));
        }

        self.initial_size = new_initial_size;
        self.current_size = new_current;
        Ok(())
    }

    /// Increment to announce once less than half the window remains
    pub fn pending_update(&self) -> Option<u32> {
        let initial = self.initial_size as i64;
        if self.current_size < initial / 2 {
            Some((initial - self.current_size) as u32)
        } else {
            None
        }
    }
}

impl Default for FlowControlWindow {
    fn default() -> Self {
        Self::with_initial_size(DEFAULT_INITIAL_WINDOW_SIZE)
    }
}

/// Send and receive windows of one stream or of the connection
#[derive(Debug, Clone, Default)]
pub struct FlowControl {
    pub send: FlowControlWindow,
    pub recv: FlowControlWindow,
}

impl FlowControl {
    pub fn new(send_size: u32, recv_size: u32) -> Self {
        FlowControl {
            send: FlowControlWindow::with_initial_size(send_size),
            recv: FlowControlWindow::with_initial_size(recv_size),
        }
    }

    /// Account for inbound DATA and return the WINDOW_UPDATE increment to
    /// send, if the receive window fell below half
    pub fn receive_data(&mut self, amount: usize) -> Result<Option<u32>> {
        self.recv.receive(amount)?;
        match self.recv.pending_update() {
            Some(increment) => {
                self.recv.increase(increment)?;
                Ok(Some(increment))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_control_window_consume() {
        let mut window = FlowControlWindow::with_initial_size(100);

        assert_eq!(window.consume(50), 50);
        assert_eq!(window.size(), 50);

        assert_eq!(window.consume(60), 50); // Only 50 available
        assert_eq!(window.size(), 0);
        assert_eq!(window.consume(10), 0);
    }

    #[test]
    fn test_flow_control_window_increase() {
        let mut window = FlowControlWindow::with_initial_size(100);
        window.consume(50);

        window.increase(100).unwrap();
        assert_eq!(window.size(), 150);

        assert!(matches!(window.increase(0), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_flow_control_window_overflow() {
        let mut window = FlowControlWindow::with_initial_size(0x7FFFFFFF);
        assert!(matches!(window.increase(1), Err(Error::FlowControl(_))));
    }

    #[test]
    fn test_update_initial_size_can_go_negative() {
        let mut window = FlowControlWindow::with_initial_size(100);
        window.consume(80);

        window.update_initial_size(200).unwrap();
        assert_eq!(window.size(), 120);

        window.update_initial_size(10).unwrap();
        assert_eq!(window.size(), -70);
        assert_eq!(window.available(), 0);
    }

    #[test]
    fn test_receive_overrun_is_flow_control_error() {
        let mut window = FlowControlWindow::with_initial_size(10);
        window.receive(10).unwrap();
        assert!(matches!(window.receive(1), Err(Error::FlowControl(_))));
    }

    #[test]
    fn test_receive_data_replenishes_at_half() {
        let mut flow = FlowControl::new(100, 100);

        assert_eq!(flow.receive_data(40).unwrap(), None);
        assert_eq!(flow.receive_data(20).unwrap(), Some(60));
        assert_eq!(flow.recv.size(), 100);
    }
}
