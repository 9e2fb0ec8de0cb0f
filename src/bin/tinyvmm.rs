#![warn(rust_2018_idioms)]

use std::{
	fs,
	num::ParseIntError,
	path::PathBuf,
	process,
	sync::atomic::{AtomicBool, Ordering},
	thread,
	time::Duration,
};

use clap::Parser;
use log::{error, info};

use tinyvmmlib::{
	Hypervisor, HypervisorResult,
	consts::{CONSOLE_PORT, DEFAULT_LOAD_ADDRESS},
	params::{GuestMemorySize, IoPortPolicy, Output, Params},
	slots::MemoryFlags,
	stats::CpuStats,
	vm::DefaultBackend,
};

fn parse_u64(s: &str) -> Result<u64, ParseIntError> {
	match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
		Some(hex) => u64::from_str_radix(hex, 16),
		None => s.parse(),
	}
}

fn parse_port(s: &str) -> Result<u16, String> {
	let port = parse_u64(s).map_err(|err| err.to_string())?;
	u16::try_from(port).map_err(|_| format!("{port:#x} is not an I/O port"))
}

#[derive(Parser, Debug)]
#[command(version, author, about)]
struct Args {
	/// Guest RAM size
	///
	/// The guest gets one region of this size, starting at guest-physical address 0.
	#[arg(short = 'm', long, default_value_t, env = "TINYVMM_MEMORY_SIZE")]
	memory_size: GuestMemorySize,

	/// Guest-physical address the payload is copied to and started at
	#[arg(short, long, default_value_t = DEFAULT_LOAD_ADDRESS, value_parser = parse_u64)]
	load_address: u64,

	/// I/O port forwarded to the console
	#[arg(long, default_value_t = CONSOLE_PORT, value_parser = parse_port)]
	console_port: u16,

	/// Skip I/O port accesses outside the console port instead of stopping
	#[arg(long)]
	ignore_unknown_ports: bool,

	/// No Kernel Samepage Merging
	///
	/// Don't advise the kernel to enable Kernel Samepage Merging [KSM] on the guest RAM.
	///
	/// [KSM]: https://www.kernel.org/doc/html/latest/admin-guide/mm/ksm.html
	#[arg(long)]
	no_ksm: bool,

	/// Console output
	///
	/// `-` writes to stdout, `none` discards the output, anything else is a
	/// file that must not exist yet.
	#[arg(short, long, default_value = "-")]
	output: Output,

	/// Print exit statistics after the guest halted
	#[arg(long)]
	stats: bool,

	/// Log rip and rax of the vCPU every MS milliseconds while the guest runs
	#[arg(long, value_name = "MS")]
	poll_registers: Option<u64>,

	/// Machine type passed to VM creation
	#[arg(long, default_value_t = 0)]
	vm_type: u64,

	/// Flat real-mode binary to execute
	payload: PathBuf,
}

impl From<&Args> for Params {
	fn from(args: &Args) -> Self {
		Self {
			console_port: args.console_port,
			io_port_policy: if args.ignore_unknown_ports {
				IoPortPolicy::Ignore
			} else {
				IoPortPolicy::Fatal
			},
			ksm: !args.no_ksm,
			output: args.output.clone(),
			stats: args.stats,
		}
	}
}

fn run(args: &Args, payload: &[u8]) -> HypervisorResult<Option<CpuStats>> {
	let hypervisor = Hypervisor::<DefaultBackend>::open()?;
	let caps = hypervisor.capabilities();
	info!(
		"max vCPUs: {}, max memory slots: {}, vCPU mmap size: {:#x}",
		caps.max_vcpus, caps.max_memory_slots, caps.vcpu_mmap_size
	);

	let vm = hypervisor.create_vm(args.vm_type, Params::from(args))?;
	let region = vm.add_region(0, args.memory_size.pages(), MemoryFlags::empty())?;
	info!(
		"slot {}: guest {:#x?} at host {:#x}",
		region.slot,
		region.address_range(),
		region.host_address
	);

	let cpu = vm.add_vcpu()?;
	vm.copy_to_guest(args.load_address, payload)?;
	vm.enter_real_mode(cpu, args.load_address)?;

	let Some(interval) = args.poll_registers.map(Duration::from_millis) else {
		return vm.run_vcpu(cpu);
	};

	let done = AtomicBool::new(false);
	thread::scope(|s| {
		s.spawn(|| {
			while !done.load(Ordering::Acquire) {
				thread::sleep(interval);
				match vm.register_snapshot(cpu) {
					Ok(snapshot) => info!("rip: {:#x} rax: {:#x}", snapshot.rip, snapshot.rax),
					Err(err) => {
						error!("{err}");
						break;
					}
				}
			}
		});
		let res = vm.run_vcpu(cpu);
		done.store(true, Ordering::Release);
		res
	})
}

fn main() {
	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

	let args = Args::parse();
	let payload = match fs::read(&args.payload) {
		Ok(payload) => payload,
		Err(err) => {
			eprintln!("Unable to read {}: {err}", args.payload.display());
			process::exit(1);
		}
	};

	match run(&args, &payload) {
		Ok(stats) => {
			if let Some(stats) = stats {
				println!("Run statistics:");
				println!("{stats}");
			}
		}
		Err(err) => {
			eprintln!("Error: {err}");
			let mut source = std::error::Error::source(&err);
			while let Some(cause) = source {
				eprintln!("  caused by: {cause}");
				source = cause.source();
			}
			process::exit(1);
		}
	}
}
