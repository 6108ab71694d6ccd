//! Arithmetic flag computation.
//!
//! Every helper takes the operands and result at the instruction's
//! operand width and rewrites the affected EFLAGS bits with Intel
//! semantics. Callers mask values to the width before calling.

use super::{EFlags, Width};

/// Even-parity lookup for the low result byte.
const fn build_parity() -> [bool; 256] {
    let mut table = [false; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = (i as u8).count_ones() % 2 == 0;
        i += 1;
    }
    table
}

static PARITY: [bool; 256] = build_parity();

/// Set SF/ZF/PF from a result; leaves CF/OF/AF alone.
pub fn set_szp(flags: &mut EFlags, result: u32, width: Width) {
    let result = result & width.mask();
    flags.set(EFlags::ZF, result == 0);
    flags.set(EFlags::SF, result & width.sign_bit() != 0);
    flags.set(EFlags::PF, PARITY[(result & 0xFF) as usize]);
}

/// Flags for `a + b (+ carry_in)`; returns the masked result.
pub fn add(flags: &mut EFlags, a: u32, b: u32, carry_in: bool, width: Width) -> u32 {
    let mask = width.mask();
    let a = a & mask;
    let b = b & mask;
    let c = carry_in as u32;
    let wide = a as u64 + b as u64 + c as u64;
    let result = (wide as u32) & mask;

    flags.set(EFlags::CF, wide > mask as u64);
    flags.set(EFlags::AF, ((a ^ b ^ result) & 0x10) != 0);
    // Overflow: operands agree in sign, result disagrees.
    flags.set(
        EFlags::OF,
        ((a ^ result) & (b ^ result) & width.sign_bit()) != 0,
    );
    set_szp(flags, result, width);
    result
}

/// Flags for `a - b (- borrow_in)`; returns the masked result.
pub fn sub(flags: &mut EFlags, a: u32, b: u32, borrow_in: bool, width: Width) -> u32 {
    let mask = width.mask();
    let a = a & mask;
    let b = b & mask;
    let c = borrow_in as u32;
    let result = a.wrapping_sub(b).wrapping_sub(c) & mask;

    flags.set(EFlags::CF, (a as u64) < b as u64 + c as u64);
    flags.set(EFlags::AF, ((a ^ b ^ result) & 0x10) != 0);
    // Overflow: operands differ in sign and the result's sign left `a`.
    flags.set(
        EFlags::OF,
        ((a ^ b) & (a ^ result) & width.sign_bit()) != 0,
    );
    set_szp(flags, result, width);
    result
}

/// Flags for AND/OR/XOR/TEST results: CF=OF=0, SZP from the result.
pub fn logic(flags: &mut EFlags, result: u32, width: Width) -> u32 {
    let result = result & width.mask();
    flags.remove(EFlags::CF | EFlags::OF | EFlags::AF);
    set_szp(flags, result, width);
    result
}

/// SHL: CF is the last bit shifted out; OF (count 1) is msb XOR CF.
pub fn shl(flags: &mut EFlags, value: u32, count: u32, width: Width) -> u32 {
    let count = count & 0x1F;
    if count == 0 {
        return value & width.mask();
    }
    let value = value & width.mask();
    let bits = width.bits();
    let result = if count >= bits { 0 } else { (value << count) & width.mask() };
    let cf = if count <= bits {
        (value >> (bits - count)) & 1 != 0
    } else {
        false
    };
    flags.set(EFlags::CF, cf);
    if count == 1 {
        flags.set(EFlags::OF, ((result & width.sign_bit()) != 0) != cf);
    }
    set_szp(flags, result, width);
    result
}

/// SHR: CF is the last bit shifted out; OF (count 1) is the original msb.
pub fn shr(flags: &mut EFlags, value: u32, count: u32, width: Width) -> u32 {
    let count = count & 0x1F;
    if count == 0 {
        return value & width.mask();
    }
    let value = value & width.mask();
    let bits = width.bits();
    let result = if count >= bits { 0 } else { value >> count };
    let cf = if count <= bits {
        (value >> (count - 1)) & 1 != 0
    } else {
        false
    };
    flags.set(EFlags::CF, cf);
    if count == 1 {
        flags.set(EFlags::OF, value & width.sign_bit() != 0);
    }
    set_szp(flags, result, width);
    result
}

/// SAR: sign-fill from the left; OF (count 1) is always clear.
pub fn sar(flags: &mut EFlags, value: u32, count: u32, width: Width) -> u32 {
    let count = count & 0x1F;
    if count == 0 {
        return value & width.mask();
    }
    let mask = width.mask();
    let bits = width.bits();
    let negative = value & width.sign_bit() != 0;
    // Sign-extend to i64 so shifts past the width converge to 0 or -1.
    let wide = if negative {
        (value & mask) as i64 - (1i64 << bits)
    } else {
        (value & mask) as i64
    };
    let shifted = wide >> count.min(63);
    let result = (shifted as u32) & mask;
    let cf = (wide >> (count - 1).min(63)) & 1 != 0;
    flags.set(EFlags::CF, cf);
    if count == 1 {
        flags.remove(EFlags::OF);
    }
    set_szp(flags, result, width);
    result
}

/// ROL: CF mirrors the new lsb; OF (count 1) is msb XOR CF. SZP untouched.
pub fn rol(flags: &mut EFlags, value: u32, count: u32, width: Width) -> u32 {
    let bits = width.bits();
    let count = (count & 0x1F) % bits;
    let value = value & width.mask();
    if count == 0 {
        return value;
    }
    let result = ((value << count) | (value >> (bits - count))) & width.mask();
    let cf = result & 1 != 0;
    flags.set(EFlags::CF, cf);
    flags.set(EFlags::OF, ((result & width.sign_bit()) != 0) != cf);
    result
}

/// ROR: CF mirrors the new msb; OF (count 1) is msb XOR next bit.
pub fn ror(flags: &mut EFlags, value: u32, count: u32, width: Width) -> u32 {
    let bits = width.bits();
    let count = (count & 0x1F) % bits;
    let value = value & width.mask();
    if count == 0 {
        return value;
    }
    let result = ((value >> count) | (value << (bits - count))) & width.mask();
    let msb = result & width.sign_bit() != 0;
    let next = result & (width.sign_bit() >> 1) != 0;
    flags.set(EFlags::CF, msb);
    flags.set(EFlags::OF, msb != next);
    result
}

/// RCL: rotate through CF.
pub fn rcl(flags: &mut EFlags, value: u32, count: u32, width: Width) -> u32 {
    let bits = width.bits() as u64;
    let count = ((count & 0x1F) as u64) % (bits + 1);
    if count == 0 {
        return value & width.mask();
    }
    let mut wide = ((value & width.mask()) as u64) | ((flags.contains(EFlags::CF) as u64) << bits);
    wide = ((wide << count) | (wide >> (bits + 1 - count))) & ((1u64 << (bits + 1)) - 1);
    let cf = wide >> bits & 1 != 0;
    let result = (wide as u32) & width.mask();
    flags.set(EFlags::CF, cf);
    flags.set(EFlags::OF, ((result & width.sign_bit()) != 0) != cf);
    result
}

/// RCR: rotate through CF the other way.
pub fn rcr(flags: &mut EFlags, value: u32, count: u32, width: Width) -> u32 {
    let bits = width.bits() as u64;
    let count = ((count & 0x1F) as u64) % (bits + 1);
    if count == 0 {
        return value & width.mask();
    }
    let mut wide = ((value & width.mask()) as u64) | ((flags.contains(EFlags::CF) as u64) << bits);
    wide = ((wide >> count) | (wide << (bits + 1 - count))) & ((1u64 << (bits + 1)) - 1);
    let cf = wide >> bits & 1 != 0;
    let result = (wide as u32) & width.mask();
    let msb = result & width.sign_bit() != 0;
    let next = result & (width.sign_bit() >> 1) != 0;
    flags.set(EFlags::CF, cf);
    flags.set(EFlags::OF, msb != next);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags() -> EFlags {
        EFlags::from_bits_truncate(EFlags::INITIAL)
    }

    #[test]
    fn add_carry_and_overflow() {
        let mut f = flags();
        let r = add(&mut f, 0xFFFF_FFFF, 1, false, Width::W32);
        assert_eq!(r, 0);
        assert!(f.contains(EFlags::CF));
        assert!(f.contains(EFlags::ZF));
        assert!(!f.contains(EFlags::OF));

        let mut f = flags();
        let r = add(&mut f, 0x7FFF_FFFF, 1, false, Width::W32);
        assert_eq!(r, 0x8000_0000);
        assert!(f.contains(EFlags::OF));
        assert!(f.contains(EFlags::SF));
        assert!(!f.contains(EFlags::CF));
    }

    #[test]
    fn add_respects_width() {
        let mut f = flags();
        let r = add(&mut f, 0xFF, 1, false, Width::W8);
        assert_eq!(r, 0);
        assert!(f.contains(EFlags::CF));
        assert!(f.contains(EFlags::ZF));

        let mut f = flags();
        let r = add(&mut f, 0x7F, 1, false, Width::W8);
        assert_eq!(r, 0x80);
        assert!(f.contains(EFlags::OF));
    }

    #[test]
    fn sub_borrow_and_overflow() {
        let mut f = flags();
        let r = sub(&mut f, 0, 1, false, Width::W32);
        assert_eq!(r, 0xFFFF_FFFF);
        assert!(f.contains(EFlags::CF));
        assert!(f.contains(EFlags::SF));

        let mut f = flags();
        let r = sub(&mut f, 0x8000_0000, 1, false, Width::W32);
        assert_eq!(r, 0x7FFF_FFFF);
        assert!(f.contains(EFlags::OF));
        assert!(!f.contains(EFlags::CF));
    }

    #[test]
    fn cmp_equal_sets_zf() {
        let mut f = flags();
        sub(&mut f, 42, 42, false, Width::W32);
        assert!(f.contains(EFlags::ZF));
        assert!(!f.contains(EFlags::CF));
    }

    #[test]
    fn parity_of_low_byte_only() {
        let mut f = flags();
        // 0x103: low byte 0x03 has two set bits -> even parity.
        set_szp(&mut f, 0x103, Width::W32);
        assert!(f.contains(EFlags::PF));
        set_szp(&mut f, 0x101, Width::W32);
        assert!(!f.contains(EFlags::PF));
    }

    #[test]
    fn logic_clears_cf_of() {
        let mut f = flags();
        f.insert(EFlags::CF | EFlags::OF);
        let r = logic(&mut f, 0xFF00_0000, Width::W32);
        assert_eq!(r, 0xFF00_0000);
        assert!(!f.contains(EFlags::CF));
        assert!(!f.contains(EFlags::OF));
        assert!(f.contains(EFlags::SF));
    }

    #[test]
    fn shl_carries_out_top_bit() {
        let mut f = flags();
        let r = shl(&mut f, 0x8000_0001, 1, Width::W32);
        assert_eq!(r, 2);
        assert!(f.contains(EFlags::CF));

        let mut f = flags();
        shl(&mut f, 1, 0, Width::W32);
        // Count 0: flags untouched (IF still from init image).
        assert!(f.contains(EFlags::IF));
        assert!(!f.contains(EFlags::CF));
    }

    #[test]
    fn shr_and_sar_differ_on_sign() {
        let mut f = flags();
        assert_eq!(shr(&mut f, 0x8000_0000, 4, Width::W32), 0x0800_0000);
        let mut f = flags();
        assert_eq!(sar(&mut f, 0x8000_0000, 4, Width::W32), 0xF800_0000);
        let mut f = flags();
        assert_eq!(sar(&mut f, 0xFFFF_FFF8u32, 3, Width::W32), 0xFFFF_FFFF);
        assert!(!f.contains(EFlags::CF)); // the three bits shifted out were zero
    }

    #[test]
    fn rol_ror_wrap() {
        let mut f = flags();
        assert_eq!(rol(&mut f, 0x8000_0000, 1, Width::W32), 1);
        assert!(f.contains(EFlags::CF));
        let mut f = flags();
        assert_eq!(ror(&mut f, 1, 1, Width::W32), 0x8000_0000);
        assert!(f.contains(EFlags::CF));
    }

    #[test]
    fn rcl_rotates_through_carry() {
        let mut f = flags();
        f.insert(EFlags::CF);
        assert_eq!(rcl(&mut f, 0, 1, Width::W32), 1);
        assert!(!f.contains(EFlags::CF));
    }
}
