use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy)]
pub enum ShutdownEvent {
    Graceful,
    Immediate,
}

/// First CTRL+C asks for a graceful drain; the second forces an exit.
pub fn spawn_ctrl_c_listener(tx: mpsc::UnboundedSender<ShutdownEvent>) {
    tokio::spawn(async move {
        let mut requests = 0u32;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            requests += 1;
            let event = if requests == 1 {
                ShutdownEvent::Graceful
            } else {
                ShutdownEvent::Immediate
            };
            if tx.send(event).is_err() || requests > 1 {
                return;
            }
        }
    });
}
