use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;

/// Performs the blocking network-identity reset while the barrier holds
/// every fetch worker parked. Implementations must not return until the new
/// identity is usable; the whole pool is stalled for the duration.
#[async_trait]
pub trait IdentityRotator: Send + Sync + 'static {
    async fn rotate(&self);
}

/// Rotates a PPPoE dial-up identity by bouncing the interface.
///
/// Each step is retried forever with a fixed delay until the OS command
/// reports success; after `fallback_after` consecutive bring-down failures
/// the pppoe service scripts are used instead of ifdown/ifup. A hung
/// rotation stalls the pool by design: no worker can make progress without
/// a clean identity.
pub struct PppRotator {
    interface: String,
    retry_delay: Duration,
    fallback_after: u32,
}

impl PppRotator {
    pub fn new(interface: impl Into<String>, retry_delay: Duration, fallback_after: u32) -> Self {
        PppRotator {
            interface: interface.into(),
            retry_delay,
            fallback_after: fallback_after.max(1),
        }
    }

    async fn run_step(&self, program: &str, args: &[&str]) -> bool {
        match Command::new(program).args(args).status().await {
            Ok(status) if status.success() => true,
            Ok(status) => {
                tracing::error!("{} {} exited with {}", program, args.join(" "), status);
                false
            }
            Err(e) => {
                tracing::error!("{} {} failed to spawn: {}", program, args.join(" "), e);
                false
            }
        }
    }
}

#[async_trait]
impl IdentityRotator for PppRotator {
    async fn rotate(&self) {
        let mut use_pppoe_scripts = false;
        let mut fail_cnt = 0;
        loop {
            let ok = if use_pppoe_scripts {
                self.run_step("pppoe-stop", &[]).await
            } else {
                self.run_step("ifdown", &[self.interface.as_str()]).await
            };
            if ok {
                break;
            }
            if !use_pppoe_scripts {
                fail_cnt += 1;
                if fail_cnt >= self.fallback_after {
                    use_pppoe_scripts = true;
                }
            }
            tokio::time::sleep(self.retry_delay).await;
        }
        loop {
            let ok = if use_pppoe_scripts {
                self.run_step("pppoe-start", &[]).await
            } else {
                self.run_step("ifup", &[self.interface.as_str()]).await
            };
            if ok {
                break;
            }
            tokio::time::sleep(self.retry_delay).await;
        }
    }
}
