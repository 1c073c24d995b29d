//! Reducer and flatten functions, and replay of a history into an aggregate.

use std::sync::Arc;

use crate::backend::Storable;

/// Folds one transaction into the aggregate: `reduce(&data, post) -> post`.
///
/// Must be pure and total. Replay correctness depends on it, and a panic
/// inside it is treated as a fatal defect: it takes the commit queue down
/// with it.
pub type ReduceFn<D, P> = Arc<dyn Fn(&D, P) -> P + Send + Sync>;

/// Compacts a chronological history into one equivalent transaction, so a
/// rebuild applies the reducer once instead of once per record.
pub type FlattenFn<D> = Arc<dyn Fn(&[D]) -> D + Send + Sync>;

/// An aggregate whose state is derived from its transaction history.
///
/// The implementing type itself is the aggregate value. Use
/// [`reducer`] to turn it into a [`ReduceFn`], or
/// [`Transactor::for_aggregate`](crate::Transactor::for_aggregate) to open a
/// transactor for it directly.
///
/// # Contract
///
/// [`apply`](Aggregate::apply) must be a pure, total function of the current
/// state and one transaction.
pub trait Aggregate: Clone + Send + Sync + 'static {
    /// The change type recorded in the log.
    type Transaction: Storable;

    /// Apply a single transaction to produce the next state.
    fn apply(self, transaction: &Self::Transaction) -> Self;
}

/// Build a [`ReduceFn`] that delegates to [`Aggregate::apply`].
pub fn reducer<A: Aggregate>() -> ReduceFn<A::Transaction, A> {
    Arc::new(|transaction: &A::Transaction, state: A| state.apply(transaction))
}

/// The reducer and optional flatten function a transactor folds with.
pub(crate) struct Fold<D, P> {
    reduce: ReduceFn<D, P>,
    flatten: Option<FlattenFn<D>>,
}

impl<D, P: Clone> Fold<D, P> {
    pub(crate) fn new(reduce: ReduceFn<D, P>, flatten: Option<FlattenFn<D>>) -> Self {
        Self { reduce, flatten }
    }

    /// Fold one transaction into `post`.
    pub(crate) fn apply(&self, data: &D, post: P) -> P {
        (self.reduce)(data, post)
    }

    /// Rebuild the aggregate from `base` and a chronological (oldest first)
    /// history.
    ///
    /// With a flatten function the whole history is compacted and applied
    /// once; otherwise every transaction is applied in order. An empty
    /// history yields `base` without calling either function.
    pub(crate) fn rebuild(&self, base: &P, history: &[D]) -> P {
        if history.is_empty() {
            return base.clone();
        }

        match &self.flatten {
            Some(flatten) => self.apply(&flatten(history), base.clone()),
            None => history
                .iter()
                .fold(base.clone(), |post, data| self.apply(data, post)),
        }
    }
}
