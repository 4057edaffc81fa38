//! The control loop: one spawned task per tunnel that sends init and
//! ping messages, watches liveness, and drives the payment controller.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use hopwire_core::{TunnelMessage, STATE_CONFIGURING, STATE_OPTIMIZED};

use crate::peer::TransportError;
use crate::tunnel::Tunnel;
use crate::unix_now;

const CHECK_INTERVAL: Duration = Duration::from_secs(1);
/// Floor between control sends, so the system route's free budget is not
/// exhausted.
const SEND_FLOOR: Duration = Duration::from_millis(200);
/// Absolute slack on top of the 33% relative bound in cheat detection.
const ACCEPTABLE_LOSS_PACKETS: u64 = 5000;

pub(crate) async fn run_control_loop(tunnel: Arc<Tunnel>, mut signal: mpsc::Receiver<()>) {
    let mut last_try: Option<Instant> = None;

    tunnel.request_control_message();
    loop {
        tokio::select! {
            _ = tunnel.cancel.cancelled() => return,
            _ = signal.recv() => {}
            _ = tokio::time::sleep(CHECK_INTERVAL) => {}
        }

        if tunnel.want_destroy.load(Ordering::Acquire) {
            // close handshake runs separately
            continue;
        }

        if let Some(prev) = last_try {
            let since = prev.elapsed();
            if since < SEND_FLOOR {
                tokio::time::sleep(SEND_FLOOR - since).await;
            }
        }
        last_try = Some(Instant::now());

        if tunnel.state() == STATE_CONFIGURING {
            match tunnel.prepare_init_message(STATE_CONFIGURING) {
                Ok(msg) => match tunnel
                    .peer
                    .send_custom_message(TunnelMessage::Message(msg))
                    .await
                {
                    Ok(()) => info!("sending tunnel init message, waiting for confirmation"),
                    Err(TransportError::NotConnected) => {
                        debug!("peer not yet connected, retrying");
                    }
                    Err(err) => error!(%err, "send tunnel init failed, retrying"),
                },
                Err(err) => error!(%err, "prepare tunnel init failed"),
            }
            continue;
        }

        let mut attach_payments = false;
        let mut paid_recv_loss = 0.0f64;

        if tunnel.state() == STATE_OPTIMIZED {
            let idle = unix_now() as i64 - tunnel.last_fully_checked_at.load(Ordering::Relaxed);
            if idle > tunnel.liveness_timeout.as_secs() as i64 {
                info!("tunnel looks disconnected, trying to reconfigure");

                // a server restart along the way drops routes; rebuild them
                if tunnel.use_payments {
                    tunnel.payments_confirmed.store(0, Ordering::Release);
                }
                let _ = tunnel.state.compare_exchange(
                    STATE_OPTIMIZED,
                    STATE_CONFIGURING,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );

                tunnel.request_control_message();
                continue;
            }

            if tunnel.use_payments {
                let received = tunnel.packets_recv.load(Ordering::Relaxed);
                let paid_used = tunnel.packets_recv_paid_consumed.load(Ordering::Relaxed);

                // attach payments only once a control round-trip proved the
                // tunnel works
                attach_payments = tunnel.control_seqno_received.load(Ordering::Acquire) > 0;
                if attach_payments
                    && paid_used > received + received / 3 + ACCEPTABLE_LOSS_PACKETS
                {
                    attach_payments = false;
                    warn!(
                        seqno = tunnel.seqno_recv.load(Ordering::Relaxed),
                        received,
                        "more than 33% of paid inbound packets lost according to seqno, very unstable network or a hop is overcharging"
                    );
                }

                if paid_used > 0 {
                    paid_recv_loss = paid_used.saturating_sub(received) as f64 / paid_used as f64;
                }
            }
        }

        let force_payments = tunnel.payments_confirmed.load(Ordering::Acquire) == 0;
        let msg = match tunnel
            .prepare_control_message(attach_payments, force_payments)
            .await
        {
            Ok(msg) => msg,
            Err(err) => {
                debug!(%err, "prepare control message failed");
                continue;
            }
        };

        debug!(
            paid_recv_loss,
            seqno_diff = tunnel
                .control_seqno
                .load(Ordering::Relaxed)
                .saturating_sub(tunnel.control_seqno_received.load(Ordering::Relaxed)),
            out_left = tunnel.packets_min_paid_out.load(Ordering::Relaxed)
                - tunnel.packets_consumed_out.load(Ordering::Relaxed),
            in_left = tunnel.packets_min_paid_in.load(Ordering::Relaxed)
                - tunnel.packets_consumed_in.load(Ordering::Relaxed),
            "sending control message"
        );

        if let Err(err) = tunnel
            .peer
            .send_custom_message(TunnelMessage::Message(msg))
            .await
        {
            error!(%err, "send tunnel control failed, retrying");
        }
    }
}
