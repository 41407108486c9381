use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// Which deadline fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleReason {
    Inactivity,
    Alone,
}

/// Temporizadores de auto-desconexión de una sesión.
///
/// No tiene tarea propia: la sesión espera [`IdleMonitor::expired`] dentro de
/// su `select!`, así que reiniciar un deadline es solo cambiar un `Instant`.
#[derive(Debug)]
pub struct IdleMonitor {
    idle_timeout: Duration,
    alone_timeout: Duration,
    idle_deadline: Option<Instant>,
    alone_deadline: Option<Instant>,
}

impl IdleMonitor {
    pub fn new(idle_timeout: Duration, alone_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            alone_timeout,
            idle_deadline: Some(Instant::now() + idle_timeout),
            alone_deadline: None,
        }
    }

    /// Actividad: reinicia el deadline de inactividad
    pub fn touch(&mut self) {
        self.idle_deadline = Some(Instant::now() + self.idle_timeout);
    }

    /// Cambio en el número de participantes reales del canal
    pub fn participants(&mut self, real: usize) {
        if real == 0 {
            if self.alone_deadline.is_none() {
                debug!("🚪 Canal vacío, desconexión en {:?}", self.alone_timeout);
                self.alone_deadline = Some(Instant::now() + self.alone_timeout);
            }
        } else if self.alone_deadline.take().is_some() {
            debug!("👋 Alguien volvió al canal, se cancela la desconexión");
        }
    }

    /// Cancela ambos deadlines
    pub fn cancel(&mut self) {
        self.idle_deadline = None;
        self.alone_deadline = None;
    }

    pub fn is_alone(&self) -> bool {
        self.alone_deadline.is_some()
    }

    pub fn idle_deadline(&self) -> Option<Instant> {
        self.idle_deadline
    }

    /// Resolves when the earliest armed deadline passes; pending forever when
    /// none is armed.
    pub async fn expired(&self) -> IdleReason {
        let next = match (self.idle_deadline, self.alone_deadline) {
            (Some(idle), Some(alone)) if alone <= idle => Some((alone, IdleReason::Alone)),
            (Some(idle), _) => Some((idle, IdleReason::Inactivity)),
            (None, Some(alone)) => Some((alone, IdleReason::Alone)),
            (None, None) => None,
        };

        match next {
            Some((deadline, reason)) => {
                sleep_until(deadline).await;
                reason
            }
            None => std::future::pending().await,
        }
    }
}
