use crate::peer::transport::{TransportEvent, TransportEvents};
use std::sync::{Arc, Mutex, PoisonError};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

/// Канал сессии: offerer создаёт его сам, answerer получает от пира
pub type DataChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

pub fn current_dc(slot: &DataChannelSlot) -> Option<Arc<RTCDataChannel>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

pub fn take_dc(slot: &DataChannelSlot) -> Option<Arc<RTCDataChannel>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

/// общий обработчик data-channel
pub fn attach_dc(dc: &Arc<RTCDataChannel>, events: TransportEvents, slot: &DataChannelSlot) {
    tracing::debug!(peer = %events.peer(), label = %dc.label(), "attach_dc called");
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(dc));

    let ev = events.clone();
    dc.on_open(Box::new(move || {
        ev.emit(TransportEvent::DataChannelOpen);
        Box::pin(async {})
    }));

    let ev = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        match String::from_utf8(msg.data.to_vec()) {
            Ok(text) => ev.emit(TransportEvent::DataChannelMessage(text)),
            Err(_) => tracing::warn!(
                peer = %ev.peer(),
                len = msg.data.len(),
                "binary data-channel message dropped"
            ),
        }
        Box::pin(async {})
    }));

    dc.on_close(Box::new(move || {
        events.emit(TransportEvent::DataChannelClosed);
        Box::pin(async {})
    }));
}
