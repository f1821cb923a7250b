use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::Config;
use crate::dispatch::DispatchTicket;
use crate::fanout::FanOut;
use crate::gateway::{ConsolePushGateway, ConsoleSmsGateway, PushGateway, SmsGateway};
use crate::models::transporter::AvailabilityRecord;
use crate::observability::metrics::Metrics;
use crate::session::SessionRegistry;
use crate::store::JobStore;

pub struct AppState {
    pub config: Config,
    pub store: JobStore,
    pub transporters: DashMap<Uuid, AvailabilityRecord>,
    pub sessions: Arc<SessionRegistry>,
    pub fanout: FanOut,
    pub dispatch_tx: mpsc::Sender<DispatchTicket>,
    pub sms: Arc<dyn SmsGateway>,
    pub push: Arc<dyn PushGateway>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: Config) -> (Self, mpsc::Receiver<DispatchTicket>) {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(config.dispatch_queue_size);
        let metrics = Metrics::new();
        let sessions = Arc::new(SessionRegistry::new());
        let fanout = FanOut::new(sessions.clone(), metrics.clone(), config.event_buffer_size);

        (
            Self {
                config,
                store: JobStore::new(),
                transporters: DashMap::new(),
                sessions,
                fanout,
                dispatch_tx,
                sms: Arc::new(ConsoleSmsGateway::new()),
                push: Arc::new(ConsolePushGateway),
                metrics,
            },
            dispatch_rx,
        )
    }
}
