//! Streaming, forward-only iteration over every stored entity.

use rusqlite::types::Value;
use std::marker::PhantomData;

use super::decode;
use crate::error::StoreError;
use crate::model::{Entity, Row};
use crate::registry::{SessionHandle, WorkerToken};

/// Lazily pages through an entity's table in rowid order.
///
/// Holds its worker's session (and keeps the worker alive) until the
/// sequence is exhausted, a page fails to load, or the iterator is
/// closed or dropped.
pub struct EntityIter<T: Entity> {
    worker: Option<WorkerToken>,
    session: Option<SessionHandle>,
    buffer: std::vec::IntoIter<Vec<Value>>,
    last_rowid: Option<i64>,
    fetch_size: usize,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> EntityIter<T> {
    /// Open the cursor and fetch the first page.
    pub(crate) fn open(
        worker: WorkerToken,
        session: SessionHandle,
        fetch_size: usize,
    ) -> Result<Self, StoreError> {
        let mut iter = Self {
            worker: Some(worker),
            session: Some(session),
            buffer: Vec::new().into_iter(),
            last_rowid: None,
            fetch_size,
            _entity: PhantomData,
        };
        iter.fetch()?;
        Ok(iter)
    }

    /// Whether the cursor's session has been let go.
    pub fn is_released(&self) -> bool {
        self.session.is_none()
    }

    /// Stop iterating and release the session.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        self.session = None;
        self.worker = None;
        self.buffer = Vec::new().into_iter();
    }

    /// Load the next page. Releases the session once the table is exhausted.
    fn fetch(&mut self) -> Result<(), StoreError> {
        let Some(session) = &self.session else {
            return Ok(());
        };
        let page = session.lock().scan_page(
            T::Row::TABLE,
            T::Row::COLUMNS,
            self.last_rowid,
            self.fetch_size,
        );
        let page = match page {
            Ok(page) => page,
            Err(e) => {
                self.release();
                return Err(e);
            }
        };

        let short = page.len() < self.fetch_size;
        if let Some((rowid, _)) = page.last() {
            self.last_rowid = Some(*rowid);
        }
        self.buffer = page
            .into_iter()
            .map(|(_, values)| values)
            .collect::<Vec<_>>()
            .into_iter();

        if short {
            self.session = None;
            self.worker = None;
        }
        Ok(())
    }
}

impl<T: Entity> Iterator for EntityIter<T> {
    type Item = Result<T, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(values) = self.buffer.next() {
            return Some(decode::<T>(values));
        }
        if self.session.is_none() {
            return None;
        }
        if let Err(e) = self.fetch() {
            return Some(Err(e));
        }
        self.buffer.next().map(decode::<T>)
    }
}
