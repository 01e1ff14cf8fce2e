/*++

Licensed under the Apache-2.0 license.

File Name:

    register.rs

Abstract:

    File contains implementation of various register types used by peripherals

--*/

use crate::BusError;
use sentinel_emu_types::{RvData, RvSize};
use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::InMemoryRegister;
use tock_registers::{LocalRegisterCopy, RegisterLongName, UIntLike};

pub trait Register {
    /// Size of the register in bytes.
    const SIZE: usize;

    /// Read data of specified size from the register
    ///
    /// # Error
    ///
    /// * `BusError` - Exception with cause `BusError::LoadAccessFault`
    fn read(&self, size: RvSize) -> Result<RvData, BusError>;

    /// Write data of specified size to the register
    ///
    /// # Error
    ///
    /// * `BusError` - Exception with cause `BusError::StoreAccessFault`
    fn write(&mut self, size: RvSize, val: RvData) -> Result<(), BusError>;
}

/// Implemented by fixed-size arrays of registers, for use with the
/// `#[register_array]` attribute of `#[derive(Bus)]`.
pub trait RegisterArray {
    /// Number of items in the array.
    const LEN: usize;

    /// Size of each item in bytes.
    const ITEM_SIZE: usize;
}

impl<T: Register, const N: usize> RegisterArray for [T; N] {
    const LEN: usize = N;
    const ITEM_SIZE: usize = T::SIZE;
}

/// RvData conversion trait
trait RvDataConverter<T: UIntLike> {
    /// Convert `RvData` to type `T`
    fn from(val: RvData) -> T;

    /// Convert `T` to type `RvData`
    fn to(val: T) -> RvData;
}

impl RvDataConverter<u8> for u8 {
    fn from(val: RvData) -> u8 {
        (val & u8::MAX as RvData) as u8
    }

    fn to(val: u8) -> RvData {
        val as RvData
    }
}

impl RvDataConverter<u16> for u16 {
    fn from(val: RvData) -> u16 {
        (val & u16::MAX as RvData) as u16
    }

    fn to(val: u16) -> RvData {
        val as RvData
    }
}

impl RvDataConverter<u32> for u32 {
    fn from(val: RvData) -> u32 {
        val
    }

    fn to(val: u32) -> RvData {
        val
    }
}

impl Register for u8 {
    const SIZE: usize = std::mem::size_of::<Self>();

    fn read(&self, size: RvSize) -> Result<RvData, BusError> {
        match size {
            RvSize::Byte => Ok(u8::to(*self)),
            _ => Err(BusError::LoadAccessFault),
        }
    }

    fn write(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        match size {
            RvSize::Byte => {
                *self = val as u8;
                Ok(())
            }
            _ => Err(BusError::StoreAccessFault),
        }
    }
}

impl Register for u16 {
    const SIZE: usize = std::mem::size_of::<Self>();

    fn read(&self, size: RvSize) -> Result<RvData, BusError> {
        match size {
            RvSize::HalfWord => Ok(u16::to(*self)),
            _ => Err(BusError::LoadAccessFault),
        }
    }

    fn write(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        match size {
            RvSize::HalfWord => {
                *self = val as u16;
                Ok(())
            }
            _ => Err(BusError::StoreAccessFault),
        }
    }
}

impl Register for u32 {
    const SIZE: usize = std::mem::size_of::<Self>();

    fn read(&self, size: RvSize) -> Result<RvData, BusError> {
        match size {
            RvSize::Word => Ok(u32::to(*self)),
            _ => Err(BusError::LoadAccessFault),
        }
    }

    fn write(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        match size {
            RvSize::Word => {
                *self = val;
                Ok(())
            }
            _ => Err(BusError::StoreAccessFault),
        }
    }
}

impl<T: UIntLike + Register, R: RegisterLongName> Register for LocalRegisterCopy<T, R> {
    const SIZE: usize = T::SIZE;

    fn read(&self, size: RvSize) -> Result<RvData, BusError> {
        Register::read(&self.get(), size)
    }

    fn write(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        let mut tmp = T::zero();
        Register::write(&mut tmp, size, val)?;
        self.set(tmp);
        Ok(())
    }
}

/// Read Write Register
pub struct ReadWriteRegister<T: UIntLike, R: RegisterLongName = ()> {
    /// Register
    pub reg: InMemoryRegister<T, R>,
}

impl<T: UIntLike, R: RegisterLongName> ReadWriteRegister<T, R> {
    /// Create an instance of Read Write Register
    pub fn new(val: T) -> Self {
        Self {
            reg: InMemoryRegister::new(val),
        }
    }
}

impl<T: UIntLike + RvDataConverter<T>, R: RegisterLongName> Register for ReadWriteRegister<T, R> {
    const SIZE: usize = std::mem::size_of::<T>();

    fn read(&self, size: RvSize) -> Result<RvData, BusError> {
        if std::mem::size_of::<T>() != size.into() {
            Err(BusError::LoadAccessFault)?
        }

        Ok(T::to(self.reg.get()))
    }

    fn write(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        if std::mem::size_of::<T>() != size.into() {
            Err(BusError::StoreAccessFault)?
        }

        self.reg.set(T::from(val));

        Ok(())
    }
}

/// Read Only Register
pub struct ReadOnlyRegister<T: UIntLike, R: RegisterLongName = ()> {
    /// Register
    pub reg: InMemoryRegister<T, R>,
}

impl<T: UIntLike, R: RegisterLongName> ReadOnlyRegister<T, R> {
    /// Create an instance of Read Only Register
    pub fn new(val: T) -> Self {
        Self {
            reg: InMemoryRegister::new(val),
        }
    }
}

impl<T: UIntLike + RvDataConverter<T>, R: RegisterLongName> Register for ReadOnlyRegister<T, R> {
    const SIZE: usize = std::mem::size_of::<T>();

    fn read(&self, size: RvSize) -> Result<RvData, BusError> {
        if std::mem::size_of::<T>() != size.into() {
            Err(BusError::LoadAccessFault)?
        }

        Ok(T::to(self.reg.get()))
    }

    fn write(&mut self, _size: RvSize, _val: RvData) -> Result<(), BusError> {
        Err(BusError::StoreAccessFault)
    }
}

/// Write Only Register
pub struct WriteOnlyRegister<T: UIntLike, R: RegisterLongName = ()> {
    pub reg: InMemoryRegister<T, R>,
}

impl<T: UIntLike, R: RegisterLongName> WriteOnlyRegister<T, R> {
    /// Create an instance of Write Only Register
    pub fn new(val: T) -> Self {
        Self {
            reg: InMemoryRegister::new(val),
        }
    }
}

impl<T: UIntLike + RvDataConverter<T>, R: RegisterLongName> Register for WriteOnlyRegister<T, R> {
    const SIZE: usize = std::mem::size_of::<T>();

    fn read(&self, _size: RvSize) -> Result<RvData, BusError> {
        Err(BusError::LoadAccessFault)
    }

    fn write(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        if std::mem::size_of::<T>() != size.into() {
            Err(BusError::StoreAccessFault)?
        }

        self.reg.set(T::from(val));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u32_read_write_reg() {
        let mut reg = ReadWriteRegister::<u32>::new(0);

        assert_eq!(reg.read(RvSize::Word).ok(), Some(0));
        assert_eq!(reg.write(RvSize::Word, 0xdead_beef).ok(), Some(()));
        assert_eq!(reg.read(RvSize::Word).ok(), Some(0xdead_beef));

        assert_eq!(
            reg.read(RvSize::Byte).err(),
            Some(BusError::LoadAccessFault)
        );
        assert_eq!(
            reg.read(RvSize::HalfWord).err(),
            Some(BusError::LoadAccessFault)
        );
        assert_eq!(
            reg.write(RvSize::Byte, 0xFF).err(),
            Some(BusError::StoreAccessFault)
        );
        assert_eq!(
            reg.write(RvSize::HalfWord, 0xFF).err(),
            Some(BusError::StoreAccessFault)
        );
    }

    #[test]
    fn test_u32_readonly_reg() {
        let mut reg = ReadOnlyRegister::<u32>::new(u32::MAX);

        assert_eq!(reg.read(RvSize::Word).ok(), Some(u32::MAX));
        assert_eq!(
            reg.write(RvSize::Word, 0xFF).err(),
            Some(BusError::StoreAccessFault)
        );
    }

    #[test]
    fn test_u32_writeonly_reg() {
        let mut reg = WriteOnlyRegister::<u32>::new(0);

        assert_eq!(reg.write(RvSize::Word, u32::MAX).ok(), Some(()));
        assert_eq!(reg.reg.get(), u32::MAX);
        assert_eq!(
            reg.read(RvSize::Word).err(),
            Some(BusError::LoadAccessFault)
        );
    }

    #[test]
    fn test_u16_read_write_reg() {
        let mut reg = ReadWriteRegister::<u16>::new(0);

        assert_eq!(reg.read(RvSize::HalfWord).ok(), Some(0));
        assert_eq!(reg.write(RvSize::HalfWord, u32::MAX).ok(), Some(()));
        assert_eq!(reg.read(RvSize::HalfWord).ok(), Some(u16::MAX as RvData));
        assert_eq!(
            reg.read(RvSize::Word).err(),
            Some(BusError::LoadAccessFault)
        );
    }

    #[test]
    fn test_register_array_consts() {
        assert_eq!(<[u32; 8] as RegisterArray>::LEN, 8);
        assert_eq!(<[u32; 8] as RegisterArray>::ITEM_SIZE, 4);
        assert_eq!(<[u16; 24] as RegisterArray>::ITEM_SIZE, 2);
    }
}
