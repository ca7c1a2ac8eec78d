//! Asynchronous record feed into the master store, so external
//! health-checkers never block on the query path.

use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

use crate::cache::Record;
use crate::master::Master;

pub struct ChannelManager {
    pub add: UnboundedSender<Record>,
    pub remove: UnboundedSender<Record>,
    pub update: UnboundedSender<Record>,
    quit: UnboundedSender<()>,
}

impl ChannelManager {
    /// Spawns the single consumer loop feeding the master store. Records are
    /// keyed on their own `domain` field; an update is a remove-then-add so
    /// a changed record refreshes in place.
    pub fn start(master: Arc<Master>) -> ChannelManager {
        let (add, mut add_rx) = unbounded_channel::<Record>();
        let (remove, mut remove_rx) = unbounded_channel::<Record>();
        let (update, mut update_rx) = unbounded_channel::<Record>();
        let (quit, mut quit_rx) = unbounded_channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    // The wildcard pattern also matches channel closure, so
                    // dropping the manager ends the loop.
                    _ = quit_rx.recv() => return,
                    Some(record) = add_rx.recv() => {
                        log::debug!(target: "channels", "add {} {}", record.fqdn(), record.rtype);
                        let domain = record.domain.clone();
                        master.add_record(&domain, record);
                    }
                    Some(record) = remove_rx.recv() => {
                        log::debug!(target: "channels", "remove {} {}", record.fqdn(), record.rtype);
                        let domain = record.domain.clone();
                        master.remove_record(&domain, &record);
                    }
                    Some(record) = update_rx.recv() => {
                        log::debug!(target: "channels", "update {} {}", record.fqdn(), record.rtype);
                        let domain = record.domain.clone();
                        master.remove_record(&domain, &record);
                        master.add_record(&domain, record);
                    }
                }
            }
        });

        ChannelManager {
            add,
            remove,
            update,
            quit,
        }
    }

    pub fn stop(&self) {
        let _ = self.quit.send(());
    }
}
