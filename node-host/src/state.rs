use crate::channel::ChannelHub;
use crate::handlers::BoundaryHandlers;

pub struct AppState {
    pub handlers: BoundaryHandlers,
    pub hub: ChannelHub,
}
