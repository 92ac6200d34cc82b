mod files;
pub mod progress;

// Export utility functions
pub use self::files::copy_to_output;
pub use self::files::create_dirs;
