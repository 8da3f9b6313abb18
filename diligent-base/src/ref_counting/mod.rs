//! Intrusive reference counting. Every shared engine object lives behind a `RefCountersImpl` record
//! that tracks strong and weak references separately. The payload is destroyed when the last strong
//! reference goes away, the record itself once the last weak reference is gone as well.
//!
//! Objects are created with `MakeNewRcObj`, owned through `RefCntAutoPtr` and observed through
//! `RefCntWeakPtr`. Composite objects can place sub-objects on their owner's counters with
//! `MakeNewRcObj::build_owned`.

mod counters;
pub use counters::ObjectState;
pub use counters::ReferenceCounters;

mod object;
pub use object::AsAny;
pub use object::Object;

mod auto_ptr;
pub use auto_ptr::DetachedRef;
pub use auto_ptr::RefCntAutoPtr;

mod weak_ptr;
pub use weak_ptr::RefCntWeakPtr;

mod make_new;
pub use make_new::MakeNewRcObj;
pub use make_new::RcSubObject;

#[cfg(test)]
mod tests;
