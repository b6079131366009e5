//! x86-64 encodings used by patches and trampolines

use super::AsAddress;

/// Size of a [`mov_rax_jmp`] stub
pub const MOV_RAX_JMP_LEN: usize = 12;
/// Size of a near `call`/`jmp` with a 32-bit displacement
pub const NEAR_BRANCH_LEN: usize = 5;
/// Opcode of `call rel32`
pub const CALL_REL32: u8 = 0xE8;
/// Opcode of `jmp rel32`
pub const JMP_REL32: u8 = 0xE9;

/// Generates `mov rax, target; jmp rax`, a jump that can reach the whole address space
pub fn mov_rax_jmp(target: impl AsAddress) -> [u8; MOV_RAX_JMP_LEN] {
    let mut code = [0x48, 0xB8, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xE0];
    code[2..10].copy_from_slice(&(target.as_address() as u64).to_le_bytes());
    code
}

/// Displacement that makes an instruction ending at `next` reach `target`, if it fits in 32 bits
pub fn rel32(next: usize, target: usize) -> Option<i32> {
    let displacement = (target as i128) - (next as i128);
    i32::try_from(displacement).ok().or_else(|| {
        // on 32-bit targets the displacement wraps around the address space
        cfg!(target_pointer_width = "32").then(|| target.wrapping_sub(next) as i32)
    })
}

/// Generates a near `call`/`jmp` at `at` to `target`, if `target` is within reach
pub fn near_branch(opcode: u8, at: usize, target: usize) -> Option<[u8; NEAR_BRANCH_LEN]> {
    let displacement = rel32(at.wrapping_add(NEAR_BRANCH_LEN), target)?;
    let mut code = [opcode, 0, 0, 0, 0];
    code[1..].copy_from_slice(&displacement.to_le_bytes());
    Some(code)
}
