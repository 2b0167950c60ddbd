use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use shared::{
    domain::{ConversationId, UserId},
    protocol::ClientSignal,
};

use crate::{
    scheduler::{Scheduler, TimerHandle},
    transport::SignalTransport,
    ClientEvent, LocalIdentity,
};

/// Idle window after the last keystroke before the local `stopped typing`
/// signal goes out.
pub(crate) const LOCAL_IDLE_TIMEOUT: Duration = Duration::from_secs(2);
/// How long a remote typist stays in the set without a refreshing event.
pub(crate) const REMOTE_TYPING_TTL: Duration = Duration::from_secs(3);

struct RemoteTypist {
    display_name: String,
    deadline: Instant,
    // replaced on refresh; dropping the old handle cancels the old expiry
    _expiry: TimerHandle,
}

struct TypingState {
    conversation: Option<ConversationId>,
    local_typing: bool,
    local_timer: Option<TimerHandle>,
    remote: HashMap<UserId, RemoteTypist>,
}

/// Tracks the local "am I typing" debounce and the per-user remote typing
/// set for the active conversation. Owns no UI state beyond the set itself.
pub struct TypingCoordinator {
    identity: LocalIdentity,
    transport: Arc<dyn SignalTransport>,
    scheduler: Arc<dyn Scheduler>,
    events: broadcast::Sender<ClientEvent>,
    state: Mutex<TypingState>,
}

impl TypingCoordinator {
    pub fn new(
        identity: LocalIdentity,
        transport: Arc<dyn SignalTransport>,
        scheduler: Arc<dyn Scheduler>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            transport,
            scheduler,
            events,
            state: Mutex::new(TypingState {
                conversation: None,
                local_typing: false,
                local_timer: None,
                remote: HashMap::new(),
            }),
        })
    }

    /// Conversation switch: all timers of the old conversation are
    /// cancelled and a pending local `typing` state is closed out.
    pub fn set_conversation(self: &Arc<Self>, conversation: Option<ConversationId>) {
        let mut state = self.lock();
        if state.local_typing {
            if let Some(current) = state.conversation {
                self.transport.send(ClientSignal::UserStoppedTyping {
                    conversation_id: current,
                });
            }
        }
        state.local_typing = false;
        state.local_timer = None;
        state.remote.clear();
        state.conversation = conversation;
    }

    /// Keystroke hook: the first keystroke announces typing once, every
    /// keystroke re-arms the idle timer.
    pub fn note_keystroke(self: &Arc<Self>) {
        let mut state = self.lock();
        let Some(conversation_id) = state.conversation else {
            return;
        };
        if !state.local_typing {
            state.local_typing = true;
            self.transport.send(ClientSignal::UserTyping {
                conversation_id,
                display_name: self.identity.display_name.clone(),
            });
        }
        let weak = Arc::downgrade(self);
        state.local_timer = Some(self.scheduler.after(
            LOCAL_IDLE_TIMEOUT,
            Box::new(move || {
                if let Some(coordinator) = weak.upgrade() {
                    coordinator.stop_local(conversation_id);
                }
            }),
        ));
    }

    /// Send hook: a sent message ends the local typing state immediately.
    pub fn note_sent(self: &Arc<Self>) {
        let conversation = self.lock().conversation;
        if let Some(conversation_id) = conversation {
            self.stop_local(conversation_id);
        }
    }

    fn stop_local(&self, conversation_id: ConversationId) {
        let mut state = self.lock();
        if state.conversation != Some(conversation_id) || !state.local_typing {
            return;
        }
        state.local_typing = false;
        state.local_timer = None;
        self.transport.send(ClientSignal::UserStoppedTyping {
            conversation_id,
        });
    }

    pub fn on_remote_typing(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        user_id: UserId,
        display_name: String,
    ) {
        if user_id == self.identity.user_id {
            return;
        }
        {
            let mut state = self.lock();
            if state.conversation != Some(conversation_id) {
                return;
            }
            let weak = Arc::downgrade(self);
            let expiry = self.scheduler.after(
                REMOTE_TYPING_TTL,
                Box::new(move || {
                    if let Some(coordinator) = weak.upgrade() {
                        coordinator.remove_remote(conversation_id, user_id);
                    }
                }),
            );
            state.remote.insert(
                user_id,
                RemoteTypist {
                    display_name,
                    deadline: Instant::now() + REMOTE_TYPING_TTL,
                    _expiry: expiry,
                },
            );
        }
        self.emit_changed(conversation_id);
    }

    pub fn on_remote_stopped(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        user_id: UserId,
    ) {
        self.remove_remote(conversation_id, user_id);
    }

    fn remove_remote(&self, conversation_id: ConversationId, user_id: UserId) {
        let removed = {
            let mut state = self.lock();
            state.conversation == Some(conversation_id) && state.remote.remove(&user_id).is_some()
        };
        if removed {
            self.emit_changed(conversation_id);
        }
    }

    /// Display names of everyone currently typing in the active
    /// conversation. The indicator is a pure function of this list.
    pub fn typing_names(&self) -> Vec<String> {
        let state = self.lock();
        let now = Instant::now();
        state
            .remote
            .values()
            .filter(|typist| typist.deadline > now)
            .map(|typist| typist.display_name.clone())
            .collect()
    }

    fn emit_changed(&self, conversation_id: ConversationId) {
        let names = self.typing_names();
        let _ = self.events.send(ClientEvent::TypingChanged {
            conversation_id,
            names,
        });
    }

    fn lock(&self) -> MutexGuard<'_, TypingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
