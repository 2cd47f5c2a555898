//! Lock-free queues carrying actions between the control thread and the
//! audio callback.
//!
//! An action queue is a [`RingBuffer`] of pointer-sized elements. Pushing
//! moves a boxed [`Action`] into the queue as a raw pointer, popping turns
//! the pointer back into the box, so ownership travels with the element and
//! neither side allocates or frees anything. A stream uses two
//! submit queues (control -> callback), one for audio actions and one for
//! `Cancel`/`FetchAndResetStats`, and one completion queue (callback ->
//! control).

use crate::action::Action;
use crate::error::Result;
use crate::ring_buffer::{RingBuffer, RingConsumer, RingProducer};

const POINTER_SIZE: usize = std::mem::size_of::<usize>();

/// Create a queue holding up to `capacity` actions (a power of two).
pub fn action_queue(capacity: usize) -> Result<(ActionSender, ActionReceiver)> {
    let (producer, consumer) = RingBuffer::new(POINTER_SIZE, capacity)?.split();
    Ok((ActionSender { producer }, ActionReceiver { consumer }))
}

/// Pushing end of an action queue.
#[derive(Debug)]
pub struct ActionSender {
    producer: RingProducer,
}

impl ActionSender {
    pub fn capacity(&self) -> usize {
        self.producer.size()
    }

    pub fn len(&self) -> usize {
        self.producer.read_available()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.producer.write_available() == 0
    }

    /// Move `action` into the queue without blocking.
    ///
    /// Gives the action back when the queue is full or the receiving end is
    /// gone.
    pub fn try_push(&mut self, action: Box<Action>) -> std::result::Result<(), Box<Action>> {
        if self.producer.write_available() == 0 || self.producer.is_orphaned() {
            return Err(action);
        }
        let pointer = Box::into_raw(action) as usize;
        let written = self.producer.write(&pointer.to_ne_bytes());
        debug_assert_eq!(written, 1);
        Ok(())
    }
}

impl Drop for ActionSender {
    fn drop(&mut self) {
        // Free whatever the receiver left behind once it is gone.
        if let Some(consumer) = self.producer.orphaned_consumer() {
            let mut receiver = ActionReceiver { consumer };
            while receiver.try_pop().is_some() {}
        }
    }
}

/// Popping end of an action queue.
#[derive(Debug)]
pub struct ActionReceiver {
    consumer: RingConsumer,
}

impl ActionReceiver {
    pub fn capacity(&self) -> usize {
        self.consumer.size()
    }

    pub fn len(&self) -> usize {
        self.consumer.read_available()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the oldest action out of the queue, `None` if it is empty.
    pub fn try_pop(&mut self) -> Option<Box<Action>> {
        let mut bytes = [0u8; POINTER_SIZE];
        if self.consumer.read(&mut bytes) == 0 {
            return None;
        }
        let pointer = usize::from_ne_bytes(bytes) as *mut Action;
        // SAFETY: every element was produced by `Box::into_raw` in `try_push`
        // and is read exactly once, so the box is reconstructed exactly once.
        Some(unsafe { Box::from_raw(pointer) })
    }
}

impl Drop for ActionReceiver {
    fn drop(&mut self) {
        while self.try_pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionId, Schedule};

    fn stats_action(id: u64) -> Box<Action> {
        Box::new(Action::fetch_and_reset_stats(ActionId(id), Schedule::asap()))
    }

    #[test]
    fn test_push_and_pop_in_order() {
        let (mut sender, mut receiver) = action_queue(4).unwrap();
        assert!(receiver.try_pop().is_none());
        assert!(!sender.is_full());

        for id in 0..3 {
            assert!(sender.try_push(stats_action(id)).is_ok());
        }
        assert_eq!(receiver.len(), 3);

        for id in 0..3 {
            assert_eq!(receiver.try_pop().map(|a| a.id()), Some(ActionId(id)));
        }
        assert!(receiver.is_empty());
    }

    #[test]
    fn test_full_queue_returns_action() {
        let (mut sender, _receiver) = action_queue(2).unwrap();
        assert!(sender.try_push(stats_action(0)).is_ok());
        assert!(sender.try_push(stats_action(1)).is_ok());

        assert!(sender.is_full());
        let rejected = sender.try_push(stats_action(2)).unwrap_err();
        assert_eq!(rejected.id(), ActionId(2));
    }

    #[test]
    fn test_push_after_receiver_dropped() {
        let (mut sender, receiver) = action_queue(2).unwrap();
        drop(receiver);
        assert!(sender.try_push(stats_action(0)).is_err());
    }

    #[test]
    fn test_capacity_must_be_power_of_two() {
        assert!(action_queue(3).is_err());
        assert_eq!(action_queue(8).unwrap().0.capacity(), 8);
    }

    #[test]
    fn test_pending_actions_are_freed() {
        let data: std::sync::Arc<[f32]> = vec![0.0; 16].into();
        let (mut sender, receiver) = action_queue(4).unwrap();
        let action = Action::play_buffer(ActionId(0), data.clone(), vec![1], Schedule::asap());
        assert!(sender.try_push(Box::new(action)).is_ok());
        assert_eq!(std::sync::Arc::strong_count(&data), 2);

        drop(receiver);
        assert_eq!(std::sync::Arc::strong_count(&data), 1);
        drop(sender);
    }

    #[test]
    fn test_actions_cross_threads() {
        let (mut sender, mut receiver) = action_queue(8).unwrap();
        let worker = std::thread::spawn(move || {
            let mut seen = Vec::new();
            while seen.len() < 100 {
                match receiver.try_pop() {
                    Some(action) => seen.push(action.id()),
                    None => std::thread::yield_now(),
                }
            }
            seen
        });

        let mut next = 0;
        while next < 100 {
            match sender.try_push(stats_action(next)) {
                Ok(()) => next += 1,
                Err(_) => std::thread::yield_now(),
            }
        }

        let seen = worker.join().unwrap();
        assert_eq!(seen, (0..100).map(ActionId).collect::<Vec<_>>());
    }
}
