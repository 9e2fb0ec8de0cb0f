#![allow(dead_code)]

use std::path::Path;

use tinyvmmlib::{
	Hypervisor, VirtualMachine,
	params::{Output, Params},
	slots::MemoryFlags,
	vm::DefaultBackend,
};

pub type KvmVm = VirtualMachine<<DefaultBackend as tinyvmmlib::backend::VirtualizationBackend>::Vm>;

/// Entry point and load address of all test payloads.
pub const LOAD_ADDRESS: u64 = 0x1000;

/// `mov dx, 0x3f8; mov al, 'A'; out dx, al; hlt`
pub const HELLO: &[u8] = &[0xba, 0xf8, 0x03, 0xb0, 0x41, 0xee, 0xf4];

/// Writes `'A'` to the console port 1000 times, then halts.
///
/// ```text
/// mov dx, 0x3f8
/// mov cx, 1000
/// loop: mov al, 'A'
/// out dx, al
/// dec cx
/// jnz loop
/// hlt
/// ```
pub const HELLO_LOOP: &[u8] = &[
	0xba, 0xf8, 0x03, 0xb9, 0xe8, 0x03, 0xb0, 0x41, 0xee, 0x49, 0x75, 0xfa, 0xf4,
];

/// `mov al, 1; out 0x80, al; hlt`
pub const POST_CODE: &[u8] = &[0xb0, 0x01, 0xe6, 0x80, 0xf4];

/// Whether the host offers KVM. Tests that need it return early otherwise.
pub fn kvm_available() -> bool {
	let available = Path::new("/dev/kvm").exists();
	if !available {
		println!("/dev/kvm not found, skipping");
	}
	available
}

pub fn buffered_params() -> Params {
	Params {
		output: Output::Buffer,
		ksm: false,
		..Default::default()
	}
}

/// Creates a VM with two pages of RAM at slot 0 and a single vCPU, loads
/// `payload` at [`LOAD_ADDRESS`] and points the vCPU to it.
pub fn setup_vm(hypervisor: &Hypervisor<DefaultBackend>, payload: &[u8], params: Params) -> KvmVm {
	env_logger::try_init().ok();
	let vm = hypervisor.create_vm(0, params).unwrap();
	vm.add_region(0, 2, MemoryFlags::empty()).unwrap();
	let cpu = vm.add_vcpu().unwrap();
	assert_eq!(cpu, 0);
	vm.copy_to_guest(LOAD_ADDRESS, payload).unwrap();
	vm.enter_real_mode(cpu, LOAD_ADDRESS).unwrap();
	vm
}
