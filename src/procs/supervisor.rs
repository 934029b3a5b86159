// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use crate::config::RunnerConfig;
use crate::output::{Record, Sink};
use crate::procs::{Instance, InstanceSpec, Termination};
use crate::signals::Interrupts;
use crate::{Error, ErrorKind};

/// Launch and monitor a fixed group of instances
///
/// Rules:
///   - instances are started in order, a failure kills every instance started before it
///   - an interrupt is reported, but children are never killed because of it
///   - output and status of all instances go through one shared sink
pub struct Supervisor {
    specs: Vec<InstanceSpec>,
    sink: Arc<dyn Sink>,
    instances: Vec<Instance>,
}

impl Supervisor {
    /// Instance ids are assigned from the position in `specs`, starting at 1
    pub fn new(specs: Vec<InstanceSpec>, sink: Arc<dyn Sink>) -> Self {
        Self {
            specs,
            sink,
            instances: Vec::new(),
        }
    }

    /// Render the arguments of every instance, fails before anything is spawned
    pub fn from_config(config: &RunnerConfig, sink: Arc<dyn Sink>) -> Result<Self, Error> {
        Ok(Self::new(config.instance_specs()?, sink))
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    /// Start all instances, either all of them are running afterwards or none are
    pub async fn start(&mut self) -> Result<(), Error> {
        if !self.instances.is_empty() {
            return Err(Error::from("supervisor already started"));
        }

        for (idx, spec) in self.specs.clone().into_iter().enumerate() {
            let mut instance = Instance::new(idx + 1, spec);

            if let Err(e) = instance.start(Arc::clone(&self.sink)) {
                info!(id = instance.id(), "failed to start, killing {} instances", idx);
                self.rollback().await;

                return Err(ErrorKind::Start {
                    id: instance.id(),
                    source: Box::new(e),
                }
                .into());
            }

            self.instances.push(instance);
        }

        info!("started {} instances", self.instances.len());
        Ok(())
    }

    /// Kill everything started so far, failures are only reported
    ///
    /// The killed instances are not joined here, a grandchild holding one of their pipes
    /// would block the error from being returned. Their waiters still reap them.
    async fn rollback(&self) {
        for instance in &self.instances {
            if let Err(e) = instance.kill().await {
                warn!(id = instance.id(), "rollback kill failed: {}", e);
                self.sink.emit(Record::Error {
                    id: instance.id(),
                    message: e.to_string(),
                });
            }
        }
    }

    /// Wait until every instance has terminated
    ///
    /// An interrupt is logged and the wait continues, instances are left to exit on
    /// their own. Terminations are returned in id order.
    pub async fn wait_for_termination<I>(
        &mut self,
        interrupts: &mut I,
    ) -> Result<Vec<Termination>, Error>
    where
        I: Interrupts + ?Sized,
    {
        let instances = std::mem::take(&mut self.instances);
        let mut all = tokio::spawn(async move {
            join_all(instances.into_iter().map(|mut instance| async move {
                let termination = instance.join().await;
                (instance, termination)
            }))
            .await
        });

        let joined = tokio::select! {
            joined = &mut all => joined,
            Some(signal) = interrupts.recv() => {
                info!(?signal, "interrupted, waiting for children");
                self.sink.emit(Record::Notice(format!(
                    "received signal {} ({})",
                    signal as i32, signal
                )));
                self.sink.emit(Record::Notice("waiting for children".to_string()));

                all.await
            }
        };

        let mut terminations = Vec::new();
        for (instance, termination) in joined? {
            if let Some(termination) = termination {
                terminations.push(termination);
            }
            self.instances.push(instance);
        }

        self.sink
            .emit(Record::Notice("children terminated".to_string()));
        Ok(terminations)
    }
}

#[cfg(test)]
mod tests {
    use crate::output::Collector;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rollback_continues_after_failed_kill() {
        let collector = Arc::new(Collector::new());
        let mut supervisor = Supervisor::new(Vec::new(), collector.clone());

        let mut exited = Instance::new(1, InstanceSpec::new("true", Vec::<String>::new()));
        exited.start(collector.clone()).unwrap();
        assert_eq!(exited.join().await, Some(Termination::Success));

        let mut running = Instance::new(2, InstanceSpec::new("sleep", vec!["30"]));
        running.start(collector.clone()).unwrap();

        supervisor.instances.push(exited);
        supervisor.instances.push(running);
        supervisor.rollback().await;

        let records = collector.records();
        assert!(records.contains(&Record::Error {
            id: 1,
            message: "instance 1 is not running".to_string(),
        }));
        assert!(!records.iter().any(|record| matches!(
            record,
            Record::Error { id: 2, message } if message.contains("not running") || message.starts_with("cannot send")
        )));

        assert_eq!(
            supervisor.instances[1].join().await,
            Some(Termination::Signaled(9))
        );
    }
}
