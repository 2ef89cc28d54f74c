pub mod kmem;
