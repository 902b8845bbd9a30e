//! Counter based join point.
//!
//! A [`Barrier`] starts with a number of pending participants. Every
//! participant calls [`Barrier::dec`] once it is done, and the completion
//! action attached with [`Barrier::end_with`] fires exactly once, when the
//! last participant leaves. The action may be attached after every
//! participant already finished, in which case it fires right away.
//!
//! Internally the counter holds one extra unit that stands for "no action
//! attached yet", so the barrier can't complete before `end_with` is called.

use std::borrow::Cow;
use std::sync::{Arc, Mutex, MutexGuard};

type Action = Box<dyn FnOnce() + Send>;

struct State {
	counter: usize,
	action: Option<Action>,
}

pub struct Barrier {
	name: Cow<'static, str>,
	state: Mutex<State>,
}

impl Barrier {
	pub fn new(name: impl Into<Cow<'static, str>>, participants: usize) -> Self {
		Self {
			name: name.into(),
			state: Mutex::new(State {
				counter: participants + 1,
				action: None,
			}),
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	fn lock(&self) -> MutexGuard<'_, State> {
		// The state is a plain counter, a poisoned lock still holds a usable value.
		self.state.lock().unwrap_or_else(|poison| poison.into_inner())
	}

	/// Registers one more participant. Does nothing once the barrier fired.
	pub fn inc(&self) {
		let mut state = self.lock();
		if state.counter > 0 {
			state.counter += 1;
		}
	}

	/// Marks one participant as done.
	pub fn dec(&self) {
		let action = {
			let mut state = self.lock();
			if state.counter == 0 {
				return;
			}
			state.counter -= 1;
			if state.counter > 0 {
				return;
			}
			state.action.take()
		};

		if let Some(action) = action {
			action();
		}
	}

	/// Completes the barrier now, regardless of the pending participants.
	pub fn force(&self) {
		let action = {
			let mut state = self.lock();
			state.counter = 0;
			state.action.take()
		};

		if let Some(action) = action {
			action();
		}
	}

	/// Attaches the completion action.
	///
	/// When nothing is pending anymore (or the barrier was forced), the action
	/// runs synchronously inside this call.
	pub fn end_with<F>(&self, action: F)
	where
		F: FnOnce() + Send + 'static,
	{
		let now = {
			let mut state = self.lock();
			match state.counter {
				0 => true,
				1 => {
					state.counter = 0;
					true
				}
				_ => {
					state.action = Some(Box::new(action));
					state.counter -= 1;
					return;
				}
			}
		};

		if now {
			action();
		}
	}

	pub fn is_pending(&self) -> bool {
		self.lock().counter > 0
	}

	/// Returns a callback that decrements this barrier once.
	pub fn decrementer(self: &Arc<Self>) -> impl FnOnce() + Send + 'static {
		let barrier = Arc::clone(self);
		move || barrier.dec()
	}
}

impl std::fmt::Debug for Barrier {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let state = self.lock();
		f.debug_struct("Barrier")
			.field("name", &self.name)
			.field("counter", &state.counter)
			.field("armed", &state.action.is_some())
			.finish()
	}
}
