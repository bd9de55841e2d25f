//! One client connection: handshake, channel demultiplexing, delivery
//! dispatch and heartbeats, all on a single task.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::channel::{Channel, ChannelContext, ChannelState, Outbound};
use super::{AmqpError, Broker};
use crate::acl::Principal;
use crate::auth::AuthenticationResult;
use crate::consumer::Delivery;
use crate::model::RequestContext;
use crate::protocol::amqp::body_chunk_size;
use crate::protocol::amqp::frame::FRAME_MIN_SIZE;
use crate::protocol::{
    AmqpCodecError, AmqpFrameCodec, ContentHeader, FieldTable, FieldValue, Frame, FrameBody,
    Inbound, Method, ProtocolHeader, ReplyCode,
};
use crate::virtualhost::VirtualHost;
use crate::Result;

/// How long to wait for `connection.close-ok` after sending a close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

static SERVER_PROPERTIES: Lazy<FieldTable> = Lazy::new(|| {
    let capabilities = FieldTable::new()
        .with("publisher_confirms", FieldValue::Boolean(false))
        .with("basic.nack", FieldValue::Boolean(true))
        .with("consumer_cancel_notify", FieldValue::Boolean(false));
    FieldTable::new()
        .with("product", FieldValue::string("FluxQ"))
        .with("version", FieldValue::string(env!("CARGO_PKG_VERSION")))
        .with("platform", FieldValue::string("Rust"))
        .with("capabilities", FieldValue::Table(capabilities))
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingProtocolHeader,
    AwaitingStartOk,
    AwaitingTuneOk,
    AwaitingOpen,
    Open,
    /// `connection.close` sent; waiting for the peer's close-ok.
    Closing,
    Closed,
}

/// Negotiated connection limits. Zero means no limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuning {
    pub channel_max: u16,
    pub frame_max: u32,
    pub heartbeat: u16,
}

impl Tuning {
    /// Takes the smaller of each limit, where zero on either side defers to
    /// the other.
    pub fn negotiate(&self, client: &Tuning) -> Tuning {
        Tuning {
            channel_max: negotiate(self.channel_max, client.channel_max),
            frame_max: negotiate(self.frame_max, client.frame_max),
            heartbeat: negotiate(self.heartbeat, client.heartbeat),
        }
    }

    /// Highest usable channel id.
    pub fn channel_limit(&self) -> u16 {
        if self.channel_max == 0 {
            u16::MAX
        } else {
            self.channel_max
        }
    }
}

fn negotiate<T: Ord + Default + Copy>(server: T, client: T) -> T {
    let unlimited = T::default();
    if server == unlimited {
        client
    } else if client == unlimited {
        server
    } else {
        server.min(client)
    }
}

enum Flow {
    Continue,
    Stop,
}

pub struct Connection<IO> {
    id: u64,
    peer: String,
    broker: Arc<Broker>,
    framed: Framed<IO, AmqpFrameCodec>,
    state: ConnectionState,
    tuning: Tuning,
    principal: Option<Principal>,
    client_id: Option<String>,
    vhost: Option<Arc<VirtualHost>>,
    request: Option<RequestContext>,
    channels: HashMap<u16, Channel>,
    delivery_tx: mpsc::UnboundedSender<Delivery>,
    deliveries: UnboundedReceiverStream<Delivery>,
    heartbeat: Option<Interval>,
    last_received: Instant,
    close_deadline: Option<Instant>,
    shutdown: Option<broadcast::Receiver<()>>,
}

impl<IO> Connection<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: IO,
        broker: Arc<Broker>,
        peer: impl Into<String>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let config = broker.config();
        let tuning = Tuning {
            channel_max: config.channel_max,
            frame_max: config.frame_max,
            heartbeat: config.heartbeat,
        };
        let codec = AmqpFrameCodec::new(tuning.frame_max as usize);
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        Self {
            id: broker.next_connection_id(),
            peer: peer.into(),
            framed: Framed::new(stream, codec),
            state: ConnectionState::AwaitingProtocolHeader,
            tuning,
            principal: None,
            client_id: None,
            vhost: None,
            request: None,
            channels: HashMap::new(),
            delivery_tx,
            deliveries: UnboundedReceiverStream::new(delivery_rx),
            heartbeat: None,
            last_received: Instant::now(),
            close_deadline: None,
            shutdown: Some(shutdown),
            broker,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn tuning(&self) -> Tuning {
        self.tuning
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Serves the connection until the peer leaves or the connection is
    /// closed, then releases everything it held.
    pub async fn run(mut self) -> Result<()> {
        self.broker.metrics().connections.connection_opened();
        let result = self.serve().await;
        self.cleanup();
        result
    }

    async fn serve(&mut self) -> Result<()> {
        match self.framed.next().await {
            Some(Ok(Inbound::ProtocolHeader(header))) if header == ProtocolHeader::AMQP_0_9_1 => {
                debug!(connection_id = self.id, ?header, "Protocol header accepted");
            }
            Some(Ok(_)) | Some(Err(AmqpCodecError::Framing(_))) => {
                debug!(connection_id = self.id, peer = %self.peer, "Unsupported protocol header");
                self.framed.send(ProtocolHeader::AMQP_0_9_1).await?;
                return Ok(());
            }
            Some(Err(AmqpCodecError::Io(e))) => return Err(e.into()),
            None => return Ok(()),
        }

        self.transition_to(ConnectionState::AwaitingStartOk);
        let mechanisms = self.broker.authenticator().mechanisms().join(" ");
        self.send_method(
            0,
            Method::ConnectionStart {
                version_major: 0,
                version_minor: 9,
                server_properties: SERVER_PROPERTIES.clone(),
                mechanisms: Bytes::from(mechanisms),
                locales: Bytes::from_static(b"en_US"),
            },
        )
        .await?;

        loop {
            let close_deadline = self.close_deadline;
            tokio::select! {
                inbound = self.framed.next() => match inbound {
                    Some(Ok(Inbound::Frame(frame))) => {
                        self.last_received = Instant::now();
                        if let Flow::Stop = self.handle_frame(frame).await? {
                            break;
                        }
                    }
                    Some(Ok(Inbound::ProtocolHeader(_))) => {
                        self.close_with(AmqpError::connection(
                            ReplyCode::FrameError,
                            "unexpected protocol header",
                        ))
                        .await?;
                    }
                    Some(Err(AmqpCodecError::Framing(e))) => {
                        warn!(connection_id = self.id, error = %e, "Framing error");
                        let code = e.reply_code();
                        // The stream cannot be resynchronised after a bad frame.
                        let _ = self.send_method(0, AmqpError::connection(code, e.to_string()).to_close_method()).await;
                        break;
                    }
                    Some(Err(AmqpCodecError::Io(e))) => return Err(e.into()),
                    None => {
                        debug!(connection_id = self.id, "Peer closed the socket");
                        break;
                    }
                },
                Some(delivery) = self.deliveries.next() => {
                    self.dispatch_delivery(delivery).await?;
                }
                _ = tick(&mut self.heartbeat) => {
                    let period = Duration::from_secs(u64::from(self.tuning.heartbeat));
                    if self.last_received.elapsed() >= period * 2 {
                        warn!(
                            connection_id = self.id,
                            peer = %self.peer,
                            "No traffic for two heartbeat intervals, closing connection"
                        );
                        break;
                    }
                    self.framed.send(Frame::heartbeat()).await?;
                }
                _ = sleep_until(close_deadline) => {
                    warn!(connection_id = self.id, "Timed out waiting for connection.close-ok");
                    break;
                }
                _ = recv_shutdown(&mut self.shutdown) => {
                    self.shutdown = None;
                    self.close_with(AmqpError::connection(
                        ReplyCode::ConnectionForced,
                        "broker is shutting down",
                    ))
                    .await?;
                }
            }
        }
        self.transition_to(ConnectionState::Closed);
        Ok(())
    }

    fn transition_to(&mut self, new_state: ConnectionState) -> bool {
        if !Self::is_valid_transition(self.state, new_state) {
            return false;
        }
        debug!(
            connection_id = self.id,
            old_state = ?self.state,
            new_state = ?new_state,
            "Connection state transition"
        );
        self.state = new_state;
        true
    }

    fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
        use ConnectionState::*;
        match (from, to) {
            (AwaitingProtocolHeader, AwaitingStartOk) => true,
            (AwaitingStartOk, AwaitingTuneOk) => true,
            (AwaitingTuneOk, AwaitingOpen) => true,
            (AwaitingOpen, Open) => true,
            (Closing, Closed) => true,
            (Closing, _) | (Closed, _) => false,
            (_, Closing) | (_, Closed) => true,
            _ => false,
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<Flow> {
        let channel_id = frame.channel;
        match self.process_frame(frame).await {
            Ok((replies, flow)) => {
                for outbound in replies {
                    self.write(channel_id, outbound).await?;
                }
                Ok(flow)
            }
            Err(e) if e.is_connection_error() => {
                self.close_with(e).await?;
                Ok(Flow::Continue)
            }
            Err(e) => {
                self.close_channel(channel_id, e).await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn process_frame(
        &mut self,
        frame: Frame,
    ) -> std::result::Result<(Vec<Outbound>, Flow), AmqpError> {
        if self.state == ConnectionState::Closing {
            return Ok(Self::while_closing(frame));
        }
        match frame.body {
            FrameBody::Heartbeat if frame.channel == 0 => Ok((Vec::new(), Flow::Continue)),
            FrameBody::Heartbeat => Err(AmqpError::connection(
                ReplyCode::FrameError,
                format!("heartbeat on channel {}", frame.channel),
            )),
            FrameBody::Method(method) if frame.channel == 0 => {
                let cause = method.clone();
                self.handle_connection_method(method)
                    .map_err(|e| e.caused_by(&cause))
            }
            _ if frame.channel == 0 => Err(AmqpError::connection(
                ReplyCode::CommandInvalid,
                "content frame on channel 0",
            )),
            _ if self.state != ConnectionState::Open => Err(AmqpError::connection(
                ReplyCode::CommandInvalid,
                format!("channel {} used before connection.open-ok", frame.channel),
            )),
            body => self
                .handle_channel_frame(frame.channel, body)
                .await
                .map(|replies| (replies, Flow::Continue)),
        }
    }

    /// Only `close`/`close-ok` matter once our close is on the wire.
    fn while_closing(frame: Frame) -> (Vec<Outbound>, Flow) {
        match frame.body {
            FrameBody::Method(Method::ConnectionCloseOk) if frame.channel == 0 => {
                (Vec::new(), Flow::Stop)
            }
            FrameBody::Method(Method::ConnectionClose { .. }) if frame.channel == 0 => (
                vec![Outbound::Method(Method::ConnectionCloseOk)],
                Flow::Stop,
            ),
            _ => (Vec::new(), Flow::Continue),
        }
    }

    fn handle_connection_method(
        &mut self,
        method: Method,
    ) -> std::result::Result<(Vec<Outbound>, Flow), AmqpError> {
        match (self.state, method) {
            (_, Method::ConnectionClose {
                reply_code,
                reply_text,
                ..
            }) => {
                info!(
                    connection_id = self.id,
                    reply_code,
                    reply_text = %reply_text,
                    "Peer closed connection"
                );
                self.transition_to(ConnectionState::Closing);
                Ok((
                    vec![Outbound::Method(Method::ConnectionCloseOk)],
                    Flow::Stop,
                ))
            }
            (
                ConnectionState::AwaitingStartOk,
                Method::ConnectionStartOk {
                    client_properties,
                    mechanism,
                    response,
                    ..
                },
            ) => {
                self.authenticate(&client_properties, &mechanism, &response)?;
                self.transition_to(ConnectionState::AwaitingTuneOk);
                let tune = Method::ConnectionTune {
                    channel_max: self.tuning.channel_max,
                    frame_max: self.tuning.frame_max,
                    heartbeat: self.tuning.heartbeat,
                };
                Ok((vec![Outbound::Method(tune)], Flow::Continue))
            }
            (
                ConnectionState::AwaitingTuneOk,
                Method::ConnectionTuneOk {
                    channel_max,
                    frame_max,
                    heartbeat,
                },
            ) => {
                self.tune(Tuning {
                    channel_max,
                    frame_max,
                    heartbeat,
                })?;
                self.transition_to(ConnectionState::AwaitingOpen);
                Ok((Vec::new(), Flow::Continue))
            }
            (ConnectionState::AwaitingOpen, Method::ConnectionOpen { virtual_host, .. }) => {
                self.open(&virtual_host)?;
                self.transition_to(ConnectionState::Open);
                Ok((
                    vec![Outbound::Method(Method::ConnectionOpenOk {
                        known_hosts: virtual_host,
                    })],
                    Flow::Continue,
                ))
            }
            (state, other) => Err(AmqpError::connection(
                ReplyCode::CommandInvalid,
                format!("unexpected method {:?} in state {:?}", other.ids(), state),
            )),
        }
    }

    fn authenticate(
        &mut self,
        client_properties: &FieldTable,
        mechanism: &str,
        response: &[u8],
    ) -> std::result::Result<(), AmqpError> {
        let authenticator = self.broker.authenticator();
        if !authenticator.mechanisms().iter().any(|m| *m == mechanism) {
            return Err(AmqpError::connection(
                ReplyCode::AccessRefused,
                format!("unsupported mechanism '{mechanism}'"),
            ));
        }
        match authenticator.authenticate(mechanism, response) {
            AuthenticationResult::Success(principal) => {
                let client_id = client_properties
                    .get("client_id")
                    .and_then(FieldValue::as_text)
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| chrono::Utc::now().timestamp_millis().to_string());
                info!(
                    connection_id = self.id,
                    principal = %principal,
                    client_id = %client_id,
                    mechanism,
                    "Authenticated"
                );
                self.principal = Some(principal);
                self.client_id = Some(client_id);
                Ok(())
            }
            AuthenticationResult::Failure(reason) => {
                warn!(connection_id = self.id, peer = %self.peer, reason = %reason, "Authentication failed");
                Err(AmqpError::connection(ReplyCode::AccessRefused, reason))
            }
        }
    }

    fn tune(&mut self, client: Tuning) -> std::result::Result<(), AmqpError> {
        let tuning = self.tuning.negotiate(&client);
        if tuning.frame_max != 0 && tuning.frame_max < FRAME_MIN_SIZE {
            return Err(AmqpError::connection(
                ReplyCode::NotAllowed,
                format!(
                    "frame-max {} is below the minimum of {FRAME_MIN_SIZE}",
                    tuning.frame_max
                ),
            ));
        }
        self.framed
            .codec_mut()
            .set_max_frame_size(tuning.frame_max as usize);
        self.heartbeat = (tuning.heartbeat > 0).then(|| {
            let period = Duration::from_secs(u64::from(tuning.heartbeat));
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        debug!(connection_id = self.id, ?tuning, "Connection tuned");
        self.tuning = tuning;
        Ok(())
    }

    fn open(&mut self, virtual_host: &str) -> std::result::Result<(), AmqpError> {
        let vhost = self.broker.virtual_host(virtual_host).ok_or_else(|| {
            AmqpError::connection(
                ReplyCode::NotFound,
                format!("unknown virtual host '{virtual_host}'"),
            )
        })?;
        let principal = self.principal.clone().ok_or_else(|| {
            AmqpError::connection(ReplyCode::CommandInvalid, "connection is not authenticated")
        })?;
        let mut request = RequestContext::new(principal, self.id);
        if let Some((host, _)) = self.peer.rsplit_once(':') {
            request = request.with_remote_host(host);
        }

        vhost
            .authorize_access(&request)
            .map_err(|e| AmqpError::connection(ReplyCode::AccessRefused, e.to_string()))?;
        if !vhost.is_active() {
            return Err(AmqpError::connection(
                ReplyCode::ConnectionForced,
                format!("virtual host '{}' is not active", vhost.name()),
            ));
        }

        info!(
            connection_id = self.id,
            peer = %self.peer,
            virtual_host = %vhost.name(),
            principal = %request.principal,
            "Connection opened"
        );
        self.vhost = Some(vhost);
        self.request = Some(request);
        Ok(())
    }

    async fn handle_channel_frame(
        &mut self,
        channel_id: u16,
        body: FrameBody,
    ) -> std::result::Result<Vec<Outbound>, AmqpError> {
        if channel_id > self.tuning.channel_limit() {
            return Err(AmqpError::connection(
                ReplyCode::NotAllowed,
                format!(
                    "channel {channel_id} exceeds channel-max {}",
                    self.tuning.channel_max
                ),
            ));
        }
        let (Some(vhost), Some(request)) = (&self.vhost, &self.request) else {
            return Err(AmqpError::connection(
                ReplyCode::CommandInvalid,
                "connection is not open",
            ));
        };
        let ctx = ChannelContext {
            vhost,
            request,
            deliveries: &self.delivery_tx,
        };
        let metrics = vhost.metrics();

        if !self.channels.contains_key(&channel_id) {
            match &body {
                FrameBody::Method(Method::ChannelOpen { .. }) => {
                    self.channels
                        .insert(channel_id, Channel::new(channel_id, self.id));
                }
                FrameBody::Method(Method::ChannelCloseOk) => return Ok(Vec::new()),
                FrameBody::Method(method) => {
                    return Err(AmqpError::channel(
                        ReplyCode::ChannelError,
                        format!("unknown channel {channel_id}"),
                    )
                    .caused_by(method))
                }
                _ => return Ok(Vec::new()),
            }
        }
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return Ok(Vec::new());
        };

        let before = channel.state();
        let replies = match body {
            FrameBody::Method(method) => channel.handle_method(&ctx, method).await?,
            FrameBody::Header(header) => {
                channel.handle_header(header)?;
                if channel.has_complete_message() {
                    channel.complete_publish(&ctx)?
                } else {
                    Vec::new()
                }
            }
            FrameBody::Body(chunk) => {
                if channel.handle_body(chunk)? {
                    channel.complete_publish(&ctx)?
                } else {
                    Vec::new()
                }
            }
            FrameBody::Heartbeat => Vec::new(),
        };
        let after = channel.state();
        if before != after {
            match after {
                ChannelState::Open => metrics.connections.channel_opened(),
                ChannelState::Closed => metrics.connections.channel_closed(),
                _ => {}
            }
        }
        Ok(replies)
    }

    /// Reports a channel-scoped error with `channel.close` on that channel.
    async fn close_channel(&mut self, channel_id: u16, error: AmqpError) -> Result<()> {
        warn!(
            connection_id = self.id,
            channel = channel_id,
            error = %error,
            "Closing channel"
        );
        let send = match (self.channels.get_mut(&channel_id), &self.vhost) {
            (Some(channel), Some(vhost)) => channel.begin_close(vhost),
            // Unknown channels are answered without being created.
            (None, _) => true,
            (Some(_), None) => false,
        };
        if send {
            self.send_method(channel_id, error.to_close_method()).await?;
        }
        Ok(())
    }

    /// Sends `connection.close` and waits for the peer's close-ok. Channels
    /// are released straight away.
    async fn close_with(&mut self, error: AmqpError) -> Result<()> {
        if matches!(
            self.state,
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            return Ok(());
        }
        warn!(
            connection_id = self.id,
            peer = %self.peer,
            error = %error,
            "Closing connection"
        );
        self.transition_to(ConnectionState::Closing);
        self.release_channels();
        self.close_deadline = Some(Instant::now() + CLOSE_TIMEOUT);
        self.send_method(0, error.to_close_method()).await
    }

    async fn dispatch_delivery(&mut self, delivery: Delivery) -> Result<()> {
        let channel_id = delivery.channel_id;
        let outbound = match (self.channels.get_mut(&channel_id), &self.vhost) {
            (Some(channel), Some(vhost)) => channel.deliver(vhost, delivery),
            _ => {
                delivery.queue.release(&delivery.entry);
                None
            }
        };
        if let Some(outbound) = outbound {
            self.write(channel_id, outbound).await?;
        }
        Ok(())
    }

    async fn send_method(&mut self, channel_id: u16, method: Method) -> Result<()> {
        self.framed.send(Frame::method(channel_id, method)).await?;
        Ok(())
    }

    /// Writes a method, or a method with its header and body frames split at
    /// the negotiated frame-max.
    async fn write(&mut self, channel_id: u16, outbound: Outbound) -> Result<()> {
        match outbound {
            Outbound::Method(method) => self.send_method(channel_id, method).await,
            Outbound::Content {
                method,
                properties,
                body,
            } => {
                self.framed.feed(Frame::method(channel_id, method)).await?;
                let header = ContentHeader::basic(body.len() as u64, properties);
                self.framed.feed(Frame::header(channel_id, header)).await?;
                let chunk = body_chunk_size(self.tuning.frame_max as usize);
                let mut offset = 0;
                while offset < body.len() {
                    let end = offset.saturating_add(chunk).min(body.len());
                    self.framed
                        .feed(Frame::content(channel_id, body.slice(offset..end)))
                        .await?;
                    offset = end;
                }
                SinkExt::<Frame>::flush(&mut self.framed).await?;
                Ok(())
            }
        }
    }

    fn release_channels(&mut self) {
        let Some(vhost) = &self.vhost else {
            return;
        };
        for channel in self.channels.values_mut() {
            if channel.close(vhost) {
                vhost.metrics().connections.channel_closed();
            }
        }
    }

    fn cleanup(&mut self) {
        self.release_channels();
        let receiver: &mut mpsc::UnboundedReceiver<Delivery> = self.deliveries.as_mut();
        receiver.close();
        while let Ok(delivery) = receiver.try_recv() {
            delivery.queue.release(&delivery.entry);
        }
        if let Some(vhost) = &self.vhost {
            let removed = vhost.connection_closed(self.id);
            if removed > 0 {
                debug!(connection_id = self.id, queues = removed, "Removed exclusive queues");
            }
        }
        self.broker.metrics().connections.connection_closed();
        info!(
            connection_id = self.id,
            peer = %self.peer,
            client_id = self.client_id.as_deref().unwrap_or("-"),
            "Connection closed"
        );
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn recv_shutdown(shutdown: &mut Option<broadcast::Receiver<()>>) {
    match shutdown {
        Some(rx) => {
            // A dropped sender means nobody can ask for shutdown any more.
            if let Err(broadcast::error::RecvError::Closed) = rx.recv().await {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending().await,
    }
}
