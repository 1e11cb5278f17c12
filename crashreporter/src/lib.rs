// BEGIN - Embark standard lints v6 for Rust 1.55+
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::flat_map_option,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::from_iter_instead_of_collect,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_digit_groups,
    clippy::large_stack_arrays,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wild_err_arm,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::missing_enforced_import_renames,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::needless_for_each,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::rc_mutex,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::single_match_else,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v6 for Rust 1.55+
// crate-specific exceptions:

//! Crash capture for multi-process applications.
//!
//! A [`CrashReporter`] arms a process-wide fault hook that writes a minidump
//! of the crashing process, plus an extra file holding the process'
//! [annotations](AnnotationStore), without allocating or locking once the
//! fault has happened.
//!
//! Child processes can instead [hand the crash](CrashReporter::setup_remote_handler)
//! to a [`Monitor`] running in another process, which dumps the child from
//! the outside and can [pair](Monitor::create_minidumps_and_pair) the dump
//! with dumps of other processes involved in the same incident.

mod annotations;
mod config;
mod crash_view;
mod dump;
mod errors;
mod extra;
mod minidump;
mod monitor;
mod raw;
mod remote;
mod reporter;
mod thread_annotations;

pub use annotations::{AnnotationStore, AnnotationTable, keys};
pub use config::{
    CRASH_LOG_ENV, DISABLE_ENV, DUMP_DIR_ENV, HandlerConfig, MonitorConfig, disabled_by_env,
};
pub use crashreporter_hook::Signal;
pub use dump::{
    Dump, delete_minidump_files_for_id, extra_file_for_id, extra_file_for_minidump,
    id_from_minidump, minidump_for_id, move_to_pending,
};
pub use errors::Error;
pub use extra::{ExtraTarget, append_extra_data, read_extra_file, write_extra_file};
pub use monitor::{Monitor, PairCompletion, PairRequest, PairedDumps, ProcessDumper, PtraceDumper};
pub use raw::CrashLog;
pub use remote::{
    CHILD_PIPE_FD, ChildPipe, Client, CrashNotice, LoopAction, MAX_PAYLOAD, PipeRegistrar,
    RemoteEndpoint, Server, ServerHandler, create_notification_pipe_for_child,
};
pub use reporter::{CrashReporter, HandlerState};
pub use thread_annotations::{ThreadAnnotations, ThreadRecord, current_thread_id};

/// The crash context sent along with crash notices
pub use crash_context::CrashContext;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("unimplemented target platform");
