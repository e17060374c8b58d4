#[cfg(all(loom, shuttle))]
compile_error!("cannot use loom and shuttle at once");

#[cfg(loom)]
pub(crate) mod alloc {
  pub(crate) use ::loom::alloc::Layout;
  pub(crate) use ::loom::alloc::alloc;
  pub(crate) use ::loom::alloc::dealloc;
  pub(crate) use ::std::alloc::handle_alloc_error;
}

#[cfg(not(loom))]
pub(crate) mod alloc {
  pub(crate) use ::std::alloc::Layout;
  pub(crate) use ::std::alloc::alloc;
  pub(crate) use ::std::alloc::dealloc;
  pub(crate) use ::std::alloc::handle_alloc_error;
}

#[cfg(not(any(loom, shuttle)))]
pub(crate) mod sync {
  pub(crate) mod atomic {
    pub(crate) use ::core::sync::atomic::AtomicBool;
    pub(crate) use ::core::sync::atomic::AtomicPtr;
    pub(crate) use ::core::sync::atomic::AtomicU32;
    pub(crate) use ::core::sync::atomic::AtomicU64;
    pub(crate) use ::core::sync::atomic::AtomicUsize;
    pub(crate) use ::core::sync::atomic::Ordering;
  }
}

#[cfg(loom)]
pub(crate) mod sync {
  pub(crate) mod atomic {
    pub(crate) use ::loom::sync::atomic::AtomicBool;
    pub(crate) use ::loom::sync::atomic::AtomicPtr;
    pub(crate) use ::loom::sync::atomic::AtomicU32;
    pub(crate) use ::loom::sync::atomic::AtomicU64;
    pub(crate) use ::loom::sync::atomic::AtomicUsize;
    pub(crate) use ::loom::sync::atomic::Ordering;
  }
}

#[cfg(shuttle)]
pub(crate) mod sync {
  pub(crate) mod atomic {
    // shuttle's atomics carry their model-checker bookkeeping in a
    // heap allocation and are not `const`-constructible, unlike
    // `core`'s. Box-wrap each one behind a `Deref` so call sites stay
    // identical across all three backends; only `new` differs.
    macro_rules! boxed_atomic {
      ($name:ident, $inner:ty, $value:ty) => {
        #[repr(transparent)]
        pub(crate) struct $name {
          inner: Box<$inner>,
        }

        impl $name {
          #[inline]
          pub(crate) fn new(value: $value) -> Self {
            Self { inner: Box::new(<$inner>::new(value)) }
          }
        }

        impl ::core::ops::Deref for $name {
          type Target = $inner;

          #[inline]
          fn deref(&self) -> &Self::Target {
            &self.inner
          }
        }
      };
    }

    boxed_atomic!(AtomicUsize, ::shuttle::sync::atomic::AtomicUsize, usize);
    boxed_atomic!(AtomicU32, ::shuttle::sync::atomic::AtomicU32, u32);
    boxed_atomic!(AtomicU64, ::shuttle::sync::atomic::AtomicU64, u64);
    boxed_atomic!(AtomicBool, ::shuttle::sync::atomic::AtomicBool, bool);

    #[repr(transparent)]
    pub(crate) struct AtomicPtr<T> {
      inner: Box<::shuttle::sync::atomic::AtomicPtr<T>>,
    }

    impl<T> AtomicPtr<T> {
      #[inline]
      pub(crate) fn new(value: *mut T) -> Self {
        Self { inner: Box::new(::shuttle::sync::atomic::AtomicPtr::new(value)) }
      }
    }

    impl<T> ::core::ops::Deref for AtomicPtr<T> {
      type Target = ::shuttle::sync::atomic::AtomicPtr<T>;

      #[inline]
      fn deref(&self) -> &Self::Target {
        &self.inner
      }
    }

    pub(crate) use ::shuttle::sync::atomic::Ordering;
  }
}
