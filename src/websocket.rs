//! # Media Tap WebSocket
//!
//! Lets an observer listen to the active call. Clients connect to
//! `/ws/media?direction=inbound|outbound|both` on the status port and receive:
//!
//! 1. **Info**: one JSON text message describing the PCM format
//! 2. **Audio**: binary messages, each one raw 16-bit little-endian PCM frame
//! 3. **Close**: when the call ends and its pipeline is released
//!
//! The tap is receive-only. Text and binary messages from the client are
//! ignored; pings are answered. A client that falls behind loses frames
//! rather than slowing the call down.

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use crate::error::{AppError, CallError};
use crate::media::{Direction, TapFrame};
use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TapFilter {
    Inbound,
    Outbound,
    #[default]
    Both,
}

impl TapFilter {
    fn accepts(&self, direction: Direction) -> bool {
        match self {
            TapFilter::Both => true,
            TapFilter::Inbound => direction == Direction::Inbound,
            TapFilter::Outbound => direction == Direction::Outbound,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TapQuery {
    #[serde(default)]
    pub direction: TapFilter,
}

/// Server-to-client text messages.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TapMessage {
    Info {
        call_id: String,
        sample_rate: u32,
        channels: u8,
        direction: TapFilter,
    },
    Lagged {
        skipped: u64,
    },
}

pub struct MediaTapSocket {
    call_id: String,
    sample_rate: u32,
    channels: u8,
    filter: TapFilter,
    frames: Option<broadcast::Receiver<TapFrame>>,
    state: web::Data<AppState>,
    last_heartbeat: Instant,
}

impl MediaTapSocket {
    fn send_json(&self, ctx: &mut ws::WebsocketContext<Self>, message: &TapMessage) {
        if let Ok(json) = serde_json::to_string(message) {
            ctx.text(json);
        }
    }
}

impl Actor for MediaTapSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(call_id = %self.call_id, direction = ?self.filter, "Media tap attached");
        self.state.tap_opened();

        self.send_json(
            ctx,
            &TapMessage::Info {
                call_id: self.call_id.clone(),
                sample_rate: self.sample_rate,
                channels: self.channels,
                direction: self.filter,
            },
        );
        if let Some(frames) = self.frames.take() {
            ctx.add_stream(BroadcastStream::new(frames));
        }

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(call_id = %act.call_id, "Media tap client timed out");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.state.tap_closed();
        info!(call_id = %self.call_id, "Media tap detached");
    }
}

/// Frames from the call.
impl StreamHandler<Result<TapFrame, BroadcastStreamRecvError>> for MediaTapSocket {
    fn handle(&mut self, item: Result<TapFrame, BroadcastStreamRecvError>, ctx: &mut Self::Context) {
        match item {
            Ok(frame) if self.filter.accepts(frame.direction) => {
                ctx.binary(frame.pcm.as_ref().clone());
            }
            Ok(_) => {}
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                debug!(call_id = %self.call_id, skipped, "Media tap client lagging");
                self.send_json(ctx, &TapMessage::Lagged { skipped });
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Normal,
            description: Some("call ended".to_string()),
        }));
        ctx.stop();
    }
}

/// Control frames from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for MediaTapSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Text(_)) | Ok(ws::Message::Binary(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(e) => {
                warn!(call_id = %self.call_id, error = %e, "Media tap protocol error");
                ctx.stop();
            }
        }
    }
}

/// Upgrade to a media tap on the active call, or answer 409 when there is none.
pub async fn media_tap(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    query: web::Query<TapQuery>,
) -> ActixResult<HttpResponse> {
    let Some(media) = state.engine.media() else {
        return Err(AppError::from(CallError::NotInCall).into());
    };
    let frames = media.subscribe().map_err(AppError::from)?;
    let format = media.format();

    let socket = MediaTapSocket {
        call_id: media.call_id().to_string(),
        sample_rate: format.sample_rate,
        channels: format.channels,
        filter: query.direction,
        frames: Some(frames),
        state: state.clone(),
        last_heartbeat: Instant::now(),
    };
    ws::start(socket, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::idle_state;
    use actix_web::{http::StatusCode, test, App};

    #[actix_web::test]
    async fn test_filter_accepts() {
        assert!(TapFilter::Both.accepts(Direction::Inbound));
        assert!(TapFilter::Both.accepts(Direction::Outbound));
        assert!(TapFilter::Inbound.accepts(Direction::Inbound));
        assert!(!TapFilter::Inbound.accepts(Direction::Outbound));
        assert!(!TapFilter::Outbound.accepts(Direction::Inbound));
    }

    #[actix_web::test]
    async fn test_info_message_shape() {
        let message = TapMessage::Info {
            call_id: "call-1".to_string(),
            sample_rate: 48_000,
            channels: 1,
            direction: TapFilter::Inbound,
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "info");
        assert_eq!(value["direction"], "inbound");
    }

    #[actix_web::test]
    async fn test_no_call_is_conflict() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(idle_state()))
                .route("/ws/media", web::get().to(media_tap)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/ws/media?direction=outbound")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
