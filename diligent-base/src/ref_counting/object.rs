use std::any::{Any, TypeId};

pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Base trait of every reference-counted engine object
pub trait Object: AsAny + Send + Sync + 'static {
    /// Returns a view of this object implementing the interface identified by `interface`. By
    /// default an object only answers for its own concrete type. Objects that expose an inner
    /// component (for example a backend-specific part) override this.
    fn query_interface(
        &self,
        interface: TypeId,
    ) -> Option<&dyn Any> {
        let this = self.as_any();
        if (*this).type_id() == interface {
            Some(this)
        } else {
            None
        }
    }
}
