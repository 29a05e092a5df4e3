use crossbeam_channel::{Receiver, Sender};
use log::warn;
use rate_core::{Rate, RateFields, RateStatus};

/// События, которые fetcher'ы отдают координатору
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PlatformEvent {
    Connected {
        platform: String,
        success: bool,
    },
    Disconnected {
        platform: String,
        success: bool,
    },
    RateAvailable {
        platform: String,
        rate_name: String,
        rate: Rate,
    },
    RateUpdate {
        platform: String,
        rate_name: String,
        fields: RateFields,
    },
    RateStatus {
        platform: String,
        rate_name: String,
        status: RateStatus,
    },
}

/// Сторона fetcher'а у канала событий.
///
/// Fetcher получает её при создании и ничего не знает о получателе.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: Sender<PlatformEvent>,
}

impl EventSink {
    pub(crate) fn new(tx: Sender<PlatformEvent>) -> Self {
        Self { tx }
    }

    pub(crate) fn channel() -> (Self, Receiver<PlatformEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self::new(tx), rx)
    }

    fn emit(&self, ev: PlatformEvent) {
        if let Err(e) = self.tx.send(ev) {
            warn!("event receiver is gone; dropping {:?}", e.into_inner());
        }
    }

    pub(crate) fn on_connect(&self, platform: &str, success: bool) {
        self.emit(PlatformEvent::Connected {
            platform: platform.to_string(),
            success,
        });
    }

    pub(crate) fn on_disconnect(&self, platform: &str, success: bool) {
        self.emit(PlatformEvent::Disconnected {
            platform: platform.to_string(),
            success,
        });
    }

    pub(crate) fn on_rate_available(&self, platform: &str, rate_name: &str, rate: Rate) {
        self.emit(PlatformEvent::RateAvailable {
            platform: platform.to_string(),
            rate_name: rate_name.to_string(),
            rate,
        });
    }

    pub(crate) fn on_rate_update(&self, platform: &str, rate_name: &str, fields: RateFields) {
        self.emit(PlatformEvent::RateUpdate {
            platform: platform.to_string(),
            rate_name: rate_name.to_string(),
            fields,
        });
    }

    #[allow(dead_code)] // ни один из текущих протоколов не присылает статус
    pub(crate) fn on_rate_status(&self, platform: &str, rate_name: &str, status: RateStatus) {
        self.emit(PlatformEvent::RateStatus {
            platform: platform.to_string(),
            rate_name: rate_name.to_string(),
            status,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_preserves_event_order() {
        let (sink, rx) = EventSink::channel();

        sink.on_connect("PF1", true);
        sink.on_rate_available("PF1", "USDTRY", Rate::new("USDTRY", 1.0, 2.0, "t"));
        sink.on_rate_status("PF1", "USDTRY", RateStatus::Inactive);
        sink.on_disconnect("PF1", true);

        let got: Vec<PlatformEvent> = rx.try_iter().collect();
        assert_eq!(got.len(), 4);
        assert!(matches!(got[0], PlatformEvent::Connected { success: true, .. }));
        assert!(matches!(got[1], PlatformEvent::RateAvailable { .. }));
        assert!(matches!(
            got[2],
            PlatformEvent::RateStatus {
                status: RateStatus::Inactive,
                ..
            }
        ));
        assert!(matches!(got[3], PlatformEvent::Disconnected { .. }));
    }

    #[test]
    fn sink_survives_dropped_receiver() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        // не паникует, только пишет warn
        sink.on_connect("PF1", false);
    }
}
