// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! One watch per kind, fanned out to every controller that reacts to it.

use crate::store::WatchStream;
use futures::{future, StreamExt};
use kube::runtime::reflector::{self, store::Writer, ReflectHandle, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Resource;

/// Objects a subscriber may fall behind before the watch waits for it
const SUBSCRIBER_BUFFER: usize = 1000;

pub struct SharedWatch<K: Resource<DynamicType = ()> + Clone + 'static> {
    reader: Store<K>,
    writer: Writer<K>,
}

impl<K> SharedWatch<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (reader, writer) = reflector::store_shared(SUBSCRIBER_BUFFER);
        Self { reader, writer }
    }

    /// Cache of the watched objects, ready after the first full listing
    pub fn reader(&self) -> Store<K> {
        self.reader.clone()
    }

    /// Objects as they are applied or relisted. Deletions are not delivered here, see
    /// [`SharedWatch::run`].
    pub fn subscribe(&self) -> Option<ReflectHandle<K>> {
        self.writer.subscribe()
    }

    /// Feed `events` into the cache and every subscriber until the stream ends. `observe`
    /// sees each event before the cache does, deletions included.
    pub async fn run(
        self,
        events: WatchStream<K>,
        mut observe: impl FnMut(&watcher::Event<K>) + Send,
    ) {
        events
            .inspect(move |event| {
                if let Ok(event) = event {
                    observe(event);
                }
            })
            .reflect_shared(self.writer)
            .for_each(|_| future::ready(()))
            .await;
    }
}

impl<K> Default for SharedWatch<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
