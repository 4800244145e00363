//! Async shell around [`ChannelController`]: one task per open channel.
//!
//! The task owns the controller, the push subscription and the mailbox for
//! network completions, and serializes everything through one select loop.
//! Handles talk to it over a bounded command channel and read the current
//! view from a watch channel.

use std::collections::HashMap;
use std::sync::Arc;

use roost_types::api::HistoryPage;
use roost_types::events::PushEnvelope;
use roost_types::models::ReactionRow;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{ChatBackend, MemberRoster, PushTransport, Subscription};
use crate::config::SessionConfig;
use crate::controller::{
    ChannelController, Confirmation, Draft, PageFetch, PageRequest, SessionState, Ticket,
};
use crate::error::{BackendError, SessionError};
use crate::overlay::ActionPayload;
use crate::view::ChannelSessionView;

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Everything a session needs from the outside.
pub struct Collaborators<B> {
    pub backend: Arc<B>,
    pub transport: Arc<dyn PushTransport>,
    pub roster: Arc<dyn MemberRoster>,
}

impl<B> Clone for Collaborators<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            transport: self.transport.clone(),
            roster: self.roster.clone(),
        }
    }
}

enum Command {
    Send { draft: Draft, reply: Reply<Uuid> },
    Edit { message_id: Uuid, content: String, reply: Reply<Uuid> },
    Delete { message_id: Uuid, reply: Reply<Uuid> },
    ToggleReaction { message_id: Uuid, emoji: String, reply: Reply<Uuid> },
    LoadOlder { reply: Reply<bool> },
    Refresh { reply: Reply<bool> },
    RetryLoad { reply: Reply<bool> },
    Close { done: oneshot::Sender<()> },
}

enum Completion {
    Page {
        request: PageRequest,
        result: Result<(HistoryPage, Vec<ReactionRow>), BackendError>,
    },
    Action {
        local_id: Uuid,
        result: Result<Confirmation, BackendError>,
    },
}

/// Cheap, cloneable handle to one open channel session.
#[derive(Clone)]
pub struct SessionHandle {
    channel_id: Uuid,
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<ChannelSessionView>,
}

impl SessionHandle {
    /// Start a session for `channel_id` and begin loading it. Must be called
    /// inside a tokio runtime.
    pub fn open<B: ChatBackend>(
        channel_id: Uuid,
        viewer: Uuid,
        config: SessionConfig,
        deps: Collaborators<B>,
    ) -> Self {
        let config = config.normalized();
        let mut controller = ChannelController::new(channel_id, viewer, config.clone());
        controller.set_viewer_profile(deps.roster.profile(channel_id, viewer));

        let (commands_tx, commands_rx) = mpsc::channel(config.mailbox_capacity);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let initial = controller.open();
        let (view_tx, view_rx) = watch::channel(controller.view());

        let task = SessionTask {
            controller,
            deps,
            subscription: None,
            commands: commands_rx,
            completions_tx,
            completions: completions_rx,
            view: view_tx,
            waiting: HashMap::new(),
            page_waiter: None,
        };
        tokio::spawn(task.run(initial));

        Self {
            channel_id,
            commands: commands_tx,
            view: view_rx,
        }
    }

    pub fn channel_id(&self) -> Uuid {
        self.channel_id
    }

    /// Current view.
    pub fn view(&self) -> ChannelSessionView {
        self.view.borrow().clone()
    }

    /// Receiver that is notified on every view change.
    pub fn watch(&self) -> watch::Receiver<ChannelSessionView> {
        self.view.clone()
    }

    /// Wait until the initial load either reached Ready or failed. Returns
    /// the view at that point.
    pub async fn wait_loaded(&self) -> Result<ChannelSessionView, SessionError> {
        let mut view = self.view.clone();
        let loaded = view
            .wait_for(|v| v.state != SessionState::Loading || v.fetch_error.is_some())
            .await
            .map_err(|_| SessionError::Closed)?;
        Ok(loaded.clone())
    }

    /// Resolves with the stored message id once the server confirmed it.
    pub async fn send_message(&self, draft: Draft) -> Result<Uuid, SessionError> {
        self.request(|reply| Command::Send { draft, reply }).await
    }

    pub async fn edit_message(&self, message_id: Uuid, content: impl Into<String>) -> Result<Uuid, SessionError> {
        let content = content.into();
        self.request(|reply| Command::Edit {
            message_id,
            content,
            reply,
        })
        .await
    }

    pub async fn delete_message(&self, message_id: Uuid) -> Result<Uuid, SessionError> {
        self.request(|reply| Command::Delete { message_id, reply })
            .await
    }

    pub async fn toggle_reaction(&self, message_id: Uuid, emoji: impl Into<String>) -> Result<Uuid, SessionError> {
        let emoji = emoji.into();
        self.request(|reply| Command::ToggleReaction {
            message_id,
            emoji,
            reply,
        })
        .await
    }

    /// `Ok(false)` when there is no older history.
    pub async fn load_older_page(&self) -> Result<bool, SessionError> {
        self.request(|reply| Command::LoadOlder { reply }).await
    }

    pub async fn refresh(&self) -> Result<bool, SessionError> {
        self.request(|reply| Command::Refresh { reply }).await
    }

    pub async fn retry_load(&self) -> Result<bool, SessionError> {
        self.request(|reply| Command::RetryLoad { reply }).await
    }

    /// Stop the session and wait until its subscription is released.
    /// In-flight requests may still finish; their results are dropped.
    pub async fn close(&self) {
        let (done, closed) = oneshot::channel();
        if self.commands.send(Command::Close { done }).await.is_ok() {
            let _ = closed.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)?
    }
}

struct SessionTask<B> {
    controller: ChannelController,
    deps: Collaborators<B>,
    subscription: Option<Subscription>,
    commands: mpsc::Receiver<Command>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    view: watch::Sender<ChannelSessionView>,
    /// Callers awaiting a settled action, with the entity they acted on.
    waiting: HashMap<Uuid, (Uuid, Reply<Uuid>)>,
    page_waiter: Option<Reply<bool>>,
}

impl<B: ChatBackend> SessionTask<B> {
    async fn run(mut self, initial: Result<PageRequest, SessionError>) {
        match initial {
            Ok(request) => self.spawn_page(request),
            Err(err) => warn!("Session {} did not open: {}", self.controller.channel_id(), err),
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Close { done }) => {
                        self.shutdown();
                        let _ = done.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command),
                    // every handle is gone
                    None => break,
                },
                Some(completion) = self.completions.recv() => self.handle_completion(completion),
                event = next_push(&mut self.subscription), if self.subscription.is_some() => {
                    match event {
                        Some(envelope) => self.handle_push(envelope),
                        None => {
                            self.subscription = None;
                            self.controller.subscription_lost("push stream ended");
                        }
                    }
                }
            }
            self.publish();
        }

        self.shutdown();
    }

    fn handle_command(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::Send { draft, reply } => {
                let ticket = self.controller.send_message(draft);
                self.dispatch(ticket, reply);
            }
            Command::Edit {
                message_id,
                content,
                reply,
            } => {
                let ticket = self.controller.edit_message(message_id, content, now);
                self.dispatch(ticket, reply);
            }
            Command::Delete { message_id, reply } => {
                let ticket = self.controller.delete_message(message_id);
                self.dispatch(ticket, reply);
            }
            Command::ToggleReaction {
                message_id,
                emoji,
                reply,
            } => {
                let ticket = self.controller.toggle_reaction(message_id, &emoji, now);
                self.dispatch(ticket, reply);
            }
            Command::LoadOlder { reply } => match self.controller.begin_older_page() {
                Ok(Some(request)) => self.await_page(request, reply),
                Ok(None) => {
                    let _ = reply.send(Ok(false));
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            Command::Refresh { reply } => {
                let request = self.controller.begin_refresh();
                self.start_page(request, reply);
            }
            Command::RetryLoad { reply } => {
                let request = self.controller.retry_load();
                self.start_page(request, reply);
            }
            Command::Close { .. } => {}
        }
    }

    fn start_page(&mut self, request: Result<PageRequest, SessionError>, reply: Reply<bool>) {
        match request {
            Ok(request) => self.await_page(request, reply),
            Err(err) => {
                let _ = reply.send(Err(err));
            }
        }
    }

    fn await_page(&mut self, request: PageRequest, reply: Reply<bool>) {
        self.page_waiter = Some(reply);
        self.spawn_page(request);
    }

    fn spawn_page(&self, request: PageRequest) {
        let backend = self.deps.backend.clone();
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = fetch_page(&*backend, request).await;
            // the session may be gone by now
            let _ = completions.send(Completion::Page { request, result });
        });
    }

    fn dispatch(&mut self, ticket: Result<Ticket, SessionError>, reply: Reply<Uuid>) {
        let ticket = match ticket {
            Ok(ticket) => ticket,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };

        let Ticket { local_id, payload } = ticket;
        self.waiting
            .insert(local_id, (payload.message_id(), reply));

        let backend = self.deps.backend.clone();
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = match payload {
                ActionPayload::Send(req) => backend.send_message(req).await.map(Confirmation::Message),
                ActionPayload::Edit(req) => backend.edit_message(req).await.map(Confirmation::Message),
                ActionPayload::Delete(req) => {
                    backend.delete_message(req).await.map(Confirmation::Message)
                }
                ActionPayload::ReactToggle(req) => backend
                    .toggle_reaction(req)
                    .await
                    .map(Confirmation::Reaction),
            };
            let _ = completions.send(Completion::Action { local_id, result });
        });
    }

    fn handle_completion(&mut self, completion: Completion) {
        let now = Instant::now();
        match completion {
            Completion::Page { request, result } => {
                let outcome = self.finish_page(request, result, now);
                if let Some(waiter) = self.page_waiter.take() {
                    let _ = waiter.send(outcome);
                }
            }
            Completion::Action { local_id, result } => {
                // an echo may already have reconciled the send
                let echoed = self.controller.take_echo(local_id);
                let stored_id = match &result {
                    Ok(Confirmation::Message(message)) => Some(message.id),
                    _ => echoed,
                };
                let outcome = self.controller.settle(local_id, result, now);
                if let Some((entity, reply)) = self.waiting.remove(&local_id) {
                    let _ = reply.send(outcome.map(|()| stored_id.unwrap_or(entity)));
                }
            }
        }
    }

    fn finish_page(
        &mut self,
        request: PageRequest,
        result: Result<(HistoryPage, Vec<ReactionRow>), BackendError>,
        now: Instant,
    ) -> Result<bool, SessionError> {
        let channel_id = self.controller.channel_id();
        let (page, rows) = match result {
            Ok(fetched) => fetched,
            Err(err) => {
                let err = SessionError::from_backend(err, channel_id);
                return Err(self.controller.fail_page(request, err));
            }
        };

        // acquired once, on the way into Ready
        if request.fetch == PageFetch::Initial && self.subscription.is_none() {
            match self.deps.transport.subscribe(channel_id) {
                Ok(subscription) => {
                    debug!("Subscribed to channel {}", channel_id);
                    self.subscription = Some(subscription);
                }
                Err(err) => {
                    let err = SessionError::Subscription(err.to_string());
                    return Err(self.controller.fail_page(request, err));
                }
            }
        }

        self.controller.finish_page(request, page, rows, now)?;
        Ok(true)
    }

    fn handle_push(&mut self, envelope: PushEnvelope) {
        if let Err(err) =
            self.controller
                .apply_push(envelope, self.deps.roster.as_ref(), Instant::now())
        {
            debug!("Push event not applied: {}", err);
        }
    }

    fn publish(&self) {
        let next = self.controller.view();
        self.view.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn shutdown(&mut self) {
        // release the subscription before anything else
        self.subscription = None;
        self.commands.close();
        self.controller.close();
        self.waiting.clear();
        self.page_waiter = None;
        self.view
            .send_replace(ChannelSessionView::closed(self.controller.channel_id()));
    }
}

async fn next_push(subscription: &mut Option<Subscription>) -> Option<PushEnvelope> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn fetch_page<B: ChatBackend>(
    backend: &B,
    request: PageRequest,
) -> Result<(HistoryPage, Vec<ReactionRow>), BackendError> {
    let page = backend
        .fetch_history(request.channel_id, request.page, request.page_size)
        .await?;
    let ids: Vec<Uuid> = page
        .messages
        .iter()
        .filter(|m| !m.is_deleted())
        .map(|m| m.id)
        .collect();
    let rows = if ids.is_empty() {
        Vec::new()
    } else {
        backend.fetch_reactions(ids).await?
    };
    Ok((page, rows))
}

/// Keeps at most one session open for a viewer, switching between channels.
pub struct ChannelSwitcher<B> {
    viewer: Uuid,
    config: SessionConfig,
    deps: Collaborators<B>,
    current: Option<SessionHandle>,
}

impl<B: ChatBackend> ChannelSwitcher<B> {
    pub fn new(viewer: Uuid, config: SessionConfig, deps: Collaborators<B>) -> Self {
        Self {
            viewer,
            config,
            deps,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&SessionHandle> {
        self.current.as_ref()
    }

    /// Make `channel_id` the open channel. The previous session is closed and
    /// its subscription released before the next one is opened.
    pub async fn switch_to(&mut self, channel_id: Uuid) -> SessionHandle {
        if let Some(current) = &self.current {
            if current.channel_id() == channel_id && !current.is_closed() {
                return current.clone();
            }
        }
        if let Some(previous) = self.current.take() {
            info!("Switching from channel {} to {}", previous.channel_id(), channel_id);
            previous.close().await;
        }

        let handle = SessionHandle::open(channel_id, self.viewer, self.config.clone(), self.deps.clone());
        self.current = Some(handle.clone());
        handle
    }

    pub async fn close(&mut self) {
        if let Some(previous) = self.current.take() {
            previous.close().await;
        }
    }
}
