// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Several producers report spans for a handful of services; a stdout "collector" prints every batch.

use std::{thread, time::Duration};

use spool::{
    Cause, Message, OverflowPolicy, Reporter, Sender,
    metrics::{InMemoryMetrics, LogExporter, ReporterMetrics},
};

#[derive(Debug)]
struct Span {
    service: &'static str,
    name: String,
}

impl Message for Span {
    type Key = &'static str;

    fn key(&self) -> Self::Key {
        self.service
    }
}

struct Stdout;

impl Sender<Span> for Stdout {
    type Output = ();

    fn send(&self, spans: &[Span]) -> Result<Vec<Result<(), Cause>>, Cause> {
        let names: Vec<_> = spans.iter().map(|span| span.name.as_str()).collect();
        println!("{}: {names:?}", spans[0].service);
        Ok(spans.iter().map(|_| Ok(())).collect())
    }

    fn close(&self) {
        println!("collector closed");
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let metrics = std::sync::Arc::new(InMemoryMetrics::<&'static str>::new());
    let reporter: Reporter<Span, Stdout> = Reporter::builder(Stdout)
        .name("demo")
        .overflow_policy(OverflowPolicy::BackPressure)
        .queued_max_messages(20)
        .buffered_max_messages(20)
        .message_timeout(Duration::from_millis(200))
        .metrics(metrics.clone())
        .metrics_exporter(LogExporter::new(Duration::from_millis(250)))
        .build()
        .expect("valid settings");

    thread::scope(|scope| {
        for service in ["checkout", "search", "inventory"] {
            let reporter = &reporter;
            scope.spawn(move || {
                for i in 0..50 {
                    reporter
                        .report(Span {
                            service,
                            name: format!("request-{i}"),
                        })
                        .expect("back pressure never rejects");
                    thread::sleep(Duration::from_millis(5));
                }
            });
        }
    });

    thread::sleep(Duration::from_millis(500));
    reporter.close();
    println!(
        "reported {} messages, dropped {}",
        metrics.messages(),
        metrics.messages_dropped()
    );
}
