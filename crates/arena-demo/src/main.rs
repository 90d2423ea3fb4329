//! Allocates a few blocks from a fixed arena, frees them again and prints
//! what the allocator looks like along the way.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use std::{process, ptr::NonNull};

use arena_alloc::{
    AllocatorConfig, ArenaAllocator, ArenaError, DeallocError, InvariantError, SelectionPolicy,
    Strategy,
};
use argh::FromArgs;
use log::{LevelFilter, info};
use snafu::ResultExt as _;
use snafu_utils::{GenericError, Report};

mod logger;

const DEFAULT_SIZES: [usize; 3] = [100, 200, 50];

/// Allocate blocks from a fixed-size arena and free them again.
#[derive(Debug, FromArgs)]
struct Args {
    /// allocation strategy: boundary-tag, sorted-list or buddy
    #[argh(option, default = "Strategy::default()")]
    strategy: Strategy,
    /// block selection policy: first-fit, best-fit or worst-fit
    #[argh(option, default = "SelectionPolicy::default()")]
    policy: SelectionPolicy,
    /// arena size in bytes
    #[argh(option, default = "1024")]
    arena_size: usize,
    /// size of a block to allocate, may be repeated (default: 100 200 50)
    #[argh(option)]
    size: Vec<usize>,
    /// free the blocks in reverse allocation order
    #[argh(switch)]
    reverse: bool,
    /// run the scenario under every strategy and policy
    #[argh(switch)]
    all: bool,
    /// print allocator trace logs
    #[argh(switch, short = 'v')]
    verbose: bool,
}

impl Args {
    fn sizes(&self) -> &[usize] {
        if self.size.is_empty() {
            &DEFAULT_SIZES
        } else {
            &self.size
        }
    }

    fn configs(&self) -> Vec<AllocatorConfig> {
        let config = |strategy, policy| AllocatorConfig {
            strategy,
            policy,
            arena_size: self.arena_size,
        };
        if self.all {
            Strategy::ALL
                .into_iter()
                .flat_map(|strategy| SelectionPolicy::ALL.map(|policy| config(strategy, policy)))
                .collect()
        } else {
            vec![config(self.strategy, self.policy)]
        }
    }
}

fn main() {
    let args: Args = argh::from_env();

    if let Err(err) = run(&args) {
        eprintln!("{}", report(err));
        process::exit(1);
    }
}

fn report(err: GenericError) -> Report<GenericError> {
    Report::new(err)
        .locate::<ArenaError>()
        .locate::<DeallocError>()
        .locate::<InvariantError>()
}

fn run(args: &Args) -> Result<(), GenericError> {
    let level = if args.verbose {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    };
    logger::init(level).whatever_context("failed to install logger")?;

    for config in args.configs() {
        run_scenario(&config, args.sizes(), args.reverse).with_whatever_context(|_| {
            format!(
                "scenario failed, strategy={}, policy={}",
                config.strategy, config.policy
            )
        })?;
    }
    Ok(())
}

fn run_scenario(
    config: &AllocatorConfig,
    sizes: &[usize],
    reverse: bool,
) -> Result<(), GenericError> {
    let mut allocator = config.build().with_whatever_context(|_| {
        format!("failed to create allocator, arena_size={}", config.arena_size)
    })?;
    info!(
        "{} ({}) over {} bytes",
        allocator.name(),
        allocator.policy(),
        allocator.arena().size()
    );

    let mut blocks: Vec<(NonNull<u8>, usize)> = vec![];
    for &size in sizes {
        match allocator.allocate(size) {
            Some(ptr) => {
                println!("allocate({size:>5}) = {}", describe(allocator.as_ref(), ptr));
                blocks.push((ptr, size));
            }
            None => println!("allocate({size:>5}) = out of memory"),
        }
    }
    print_free_blocks(allocator.as_ref());
    allocator
        .check_invariants()
        .whatever_context("allocator invariant violated after allocating")?;

    if reverse {
        blocks.reverse();
    }
    for (ptr, size) in blocks {
        // SAFETY: `ptr` was returned by this allocator for `size` bytes and is
        // freed exactly once.
        unsafe { allocator.deallocate(ptr, size) }.with_whatever_context(|_| {
            format!("failed to free {}", describe(allocator.as_ref(), ptr))
        })?;
        println!("deallocate({})", describe(allocator.as_ref(), ptr));
    }
    print_free_blocks(allocator.as_ref());
    allocator
        .check_invariants()
        .whatever_context("allocator invariant violated after freeing")?;

    println!("{}", allocator.stats());
    Ok(())
}

fn describe(allocator: &dyn ArenaAllocator, ptr: NonNull<u8>) -> String {
    match allocator.arena().offset_of(ptr) {
        Some(offset) => format!("offset {offset:#06x}"),
        None => format!("{ptr:p}"),
    }
}

fn print_free_blocks(allocator: &dyn ArenaAllocator) {
    let free = allocator.free_blocks();
    println!("free blocks: {}", free.len());
    for block in free {
        println!("  {:#06x}..{:#06x} ({} bytes)", block.offset, block.end(), block.size);
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::from_args(&["arena-demo"], args).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);
        assert_eq!(args.strategy, Strategy::BoundaryTag);
        assert_eq!(args.policy, SelectionPolicy::FirstFit);
        assert_eq!(args.arena_size, 1024);
        assert_eq!(args.sizes(), &DEFAULT_SIZES);
        assert_eq!(args.configs().len(), 1);
    }

    #[test]
    fn test_options() {
        let args = parse(&[
            "--strategy",
            "buddy",
            "--policy",
            "worst-fit",
            "--arena-size",
            "4096",
            "--size",
            "8",
            "--size",
            "16",
        ]);
        assert_eq!(args.sizes(), &[8, 16]);
        let config = args.configs()[0];
        assert_eq!(config.strategy, Strategy::Buddy);
        assert_eq!(config.policy, SelectionPolicy::WorstFit);
        assert_eq!(config.arena_size, 4096);
    }

    #[test]
    fn test_invalid_policy_is_rejected() {
        assert!(Args::from_args(&["arena-demo"], &["--policy", "next-fit"]).is_err());
    }

    #[test]
    fn test_failed_scenario_report() {
        let config = AllocatorConfig {
            strategy: Strategy::Buddy,
            policy: SelectionPolicy::FirstFit,
            arena_size: 0,
        };
        let err = run_scenario(&config, &DEFAULT_SIZES, false).unwrap_err();
        let rendered = report(err).to_string();
        assert!(rendered.starts_with("Error: failed to create allocator, arena_size=0\n  at "));
        assert!(rendered.contains("   0: arena size must be greater than zero\n      at "));
        assert!(rendered.contains("buddy.rs"));
    }

    #[test]
    fn test_all_scenarios_succeed() {
        let args = parse(&["--all", "--reverse"]);
        assert_eq!(args.configs().len(), 9);
        for config in args.configs() {
            run_scenario(&config, args.sizes(), args.reverse).unwrap();
        }
    }
}
