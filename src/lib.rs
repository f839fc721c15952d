//! Driver for the INA226 current, voltage and power monitor.
//!
//! The driver owns the I2C bus, converts raw register counts into Amps, Volts
//! and Watts, and packs the configuration and calibration registers. Enable
//! the `async` feature to get the same API over `embedded-hal-async`.
#![cfg_attr(not(test), no_std)]

// Imports
use byteorder::{ByteOrder, LittleEndian};
use core::fmt::{Debug, Display};

const VOLTAGE_LSB: f64 = 0.00125; // in Volts (1.25 mV)
const CURRENT_LSB: f64 = 0.001; // in Amps (1 mA)
const POWER_LSB: f64 = 25.0 * CURRENT_LSB; // in Watts (25 mW)

/// Fixed constant of the datasheet calibration equation.
const CALIBRATION_CONSTANT: f64 = 0.00512;
/// `current_lsb = max_expected_current / 2^15`
const CURRENT_LSB_DIVISOR: f64 = 32768.0;

/// Address with A0 and A1 both tied to GND.
pub const DEFAULT_ADDRESS: u8 = 0x40;

const FIELD_MASK: u16 = 0x07;
const MODE_SHIFT: u16 = 0;
const VSHCT_SHIFT: u16 = 3;
const VBUSCT_SHIFT: u16 = 6;
const AVERAGE_SHIFT: u16 = 9;
const RESET_BIT: u16 = 1 << 15;

/// Connection of the A0/A1 address pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlaveAddressing {
    Gnd,
    Vs,
    Sda,
    Scl,
}

/// 7-bit address selected by the A0/A1 strapping (datasheet table 2).
pub fn convert_slave_address(a0: SlaveAddressing, a1: SlaveAddressing) -> u8 {
    fn pin(p: SlaveAddressing) -> u8 {
        match p {
            SlaveAddressing::Gnd => 0,
            SlaveAddressing::Vs => 1,
            SlaveAddressing::Sda => 2,
            SlaveAddressing::Scl => 3,
        }
    }
    DEFAULT_ADDRESS | (pin(a1) << 2) | pin(a0)
}

/// Register pointers understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Register {
    Configuration = 0x00,
    Voltage = 0x01,
    Power = 0x03,
    Current = 0x04,
    Calibration = 0x05,
    MaskEnable = 0x06,
    AlertLimit = 0x07,
}

impl Register {
    pub const fn addr(self) -> u8 {
        self as u8
    }
}

/// Operating mode, bits 0-2 of the configuration register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InaMode {
    PowerDown = 0x00,
    ShuntVoltageTriggered = 0x01,
    BusVoltageTriggered = 0x02,
    ShuntAndBusTriggered = 0x03,
    PowerDown2 = 0x04,
    ShuntVoltageContinuous = 0x05,
    BusVoltageContinuous = 0x06,
    ShuntAndBusContinuous = 0x07,
}

impl InaMode {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x00 => Some(InaMode::PowerDown),
            0x01 => Some(InaMode::ShuntVoltageTriggered),
            0x02 => Some(InaMode::BusVoltageTriggered),
            0x03 => Some(InaMode::ShuntAndBusTriggered),
            0x04 => Some(InaMode::PowerDown2),
            0x05 => Some(InaMode::ShuntVoltageContinuous),
            0x06 => Some(InaMode::BusVoltageContinuous),
            0x07 => Some(InaMode::ShuntAndBusContinuous),
            _ => None,
        }
    }
}

/// Shunt voltage conversion time, bits 3-5.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InaVshct {
    _140_us = 0x00,
    _204_us = 0x01,
    _332_us = 0x02,
    _588_us = 0x03,
    _1_1_ms = 0x04,
    _2_116_ms = 0x05,
    _4_156_ms = 0x06,
    _8_244_ms = 0x07,
}

/// Bus voltage conversion time, bits 6-8.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InaVbusct {
    _140_us = 0x00,
    _204_us = 0x01,
    _332_us = 0x02,
    _588_us = 0x03,
    _1_1_ms = 0x04,
    _2_116_ms = 0x05,
    _4_156_ms = 0x06,
    _8_244_ms = 0x07,
}

/// Number of averaged samples, bits 9-11.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InaAverage {
    _1 = 0x00,
    _4 = 0x01,
    _16 = 0x02,
    _64 = 0x03,
    _128 = 0x04,
    _256 = 0x05,
    _512 = 0x06,
    _1024 = 0x07,
}

/// Bits of the Mask/Enable register.
///
/// The driver writes and reads the register as a plain `u16`; these are
/// helpers for callers building or inspecting that value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MaskEnable {
    ShuntOverVoltage = 1 << 15,
    ShuntUnderVoltage = 1 << 14,
    BusOverVoltage = 1 << 13,
    BusUnderVoltage = 1 << 12,
    PowerOverLimit = 1 << 11,
    ConversionReady = 1 << 10,
    AlertFunctionFlag = 1 << 4,
    ConversionReadyFlag = 1 << 3,
    MathOverflowFlag = 1 << 2,
    AlertPolarityBit = 1 << 1,
    AlertLatchEnable = 1,
}

impl MaskEnable {
    pub const fn bits(self) -> u16 {
        self as u16
    }

    pub const fn is_set(self, register: u16) -> bool {
        register & self.bits() != 0
    }

    /// OR of all given bits.
    pub fn mask_of(bits: &[MaskEnable]) -> u16 {
        bits.iter().fold(0, |acc, bit| acc | bit.bits())
    }
}

/// Caller-supplied value that was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Parameter {
    MaxExpectedCurrent,
    ShuntResistance,
    Address,
    OperationMode,
    ShuntVoltageConversion,
    BusVoltageConversion,
    AverageMode,
    Calibration,
}

impl Display for Parameter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Parameter::MaxExpectedCurrent => write!(f, "max expected current must be positive"),
            Parameter::ShuntResistance => write!(f, "shunt resistance must be positive"),
            Parameter::Address => write!(f, "address does not fit in 7 bits"),
            Parameter::OperationMode => write!(f, "operation mode does not fit in 3 bits"),
            Parameter::ShuntVoltageConversion => {
                write!(f, "shunt voltage conversion does not fit in 3 bits")
            }
            Parameter::BusVoltageConversion => {
                write!(f, "bus voltage conversion does not fit in 3 bits")
            }
            Parameter::AverageMode => write!(f, "average mode does not fit in 3 bits"),
            Parameter::Calibration => write!(f, "calibration value does not fit the register"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
    /// The bus reported a failure; no retry was attempted.
    I2c(E),
    InvalidParameter(Parameter),
}

impl<E> From<E> for Error<E> {
    fn from(value: E) -> Self {
        Error::I2c(value)
    }
}

impl<E: Debug> Display for Error<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::I2c(err) => write!(f, "I2C error: {err:?}"),
            Error::InvalidParameter(param) => write!(f, "Invalid Parameter: {param}"),
        }
    }
}

/// Board-level description of one sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ComponentConfig {
    /// Amps
    pub max_expected_current: f64,
    /// Ohms
    pub shunt_resistance: f64,
    /// 7-bit address
    pub sensor_address: u8,
}

impl ComponentConfig {
    pub fn new(max_expected_current: f64, shunt_resistance: f64, sensor_address: u8) -> Self {
        ComponentConfig {
            max_expected_current,
            shunt_resistance,
            sensor_address,
        }
    }

    pub fn with_address_pins(
        max_expected_current: f64,
        shunt_resistance: f64,
        a0: SlaveAddressing,
        a1: SlaveAddressing,
    ) -> Self {
        Self::new(
            max_expected_current,
            shunt_resistance,
            convert_slave_address(a0, a1),
        )
    }

    pub fn validate(&self) -> Result<(), Parameter> {
        if !self.max_expected_current.is_finite() || self.max_expected_current <= 0.0 {
            return Err(Parameter::MaxExpectedCurrent);
        }
        if !self.shunt_resistance.is_finite() || self.shunt_resistance <= 0.0 {
            return Err(Parameter::ShuntResistance);
        }
        if self.sensor_address > 0x7F {
            return Err(Parameter::Address);
        }
        Ok(())
    }
}

/// Contents of the configuration register.
///
/// The 3-bit fields hold raw datasheet codes so that values read back from
/// the device can always be represented; the `with_*` setters take the typed
/// enums instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SensorModes {
    pub operation_mode: u8,
    pub shunt_voltage_conversion: u8,
    pub bus_voltage_conversion: u8,
    pub average_mode: u8,
    pub reset_registers: bool,
}

impl Default for SensorModes {
    /// Power-on setting: continuous shunt and bus, 1.1 ms, no averaging.
    fn default() -> Self {
        SensorModes {
            operation_mode: InaMode::ShuntAndBusContinuous as u8,
            shunt_voltage_conversion: InaVshct::_1_1_ms as u8,
            bus_voltage_conversion: InaVbusct::_1_1_ms as u8,
            average_mode: InaAverage::_1 as u8,
            reset_registers: false,
        }
    }
}

fn pack_field(value: u8, shift: u16, param: Parameter) -> Result<u16, Parameter> {
    let value = u16::from(value);
    if value > FIELD_MASK {
        return Err(param);
    }
    Ok(value << shift)
}

fn unpack_field(word: u16, shift: u16) -> u8 {
    ((word >> shift) & FIELD_MASK) as u8
}

impl SensorModes {
    pub fn with_mode(mut self, value: InaMode) -> Self {
        self.operation_mode = value as u8;
        self
    }

    pub fn with_shunt_conversion(mut self, value: InaVshct) -> Self {
        self.shunt_voltage_conversion = value as u8;
        self
    }

    pub fn with_bus_conversion(mut self, value: InaVbusct) -> Self {
        self.bus_voltage_conversion = value as u8;
        self
    }

    pub fn with_average(mut self, value: InaAverage) -> Self {
        self.average_mode = value as u8;
        self
    }

    pub fn with_reset(mut self, reset: bool) -> Self {
        self.reset_registers = reset;
        self
    }

    /// `None` when `operation_mode` holds a value wider than 3 bits.
    pub fn mode(&self) -> Option<InaMode> {
        InaMode::from_bits(self.operation_mode)
    }

    /// Packs the fields into the configuration word, rejecting any field
    /// that would spill into its neighbour.
    pub fn encode(&self) -> Result<u16, Parameter> {
        let mut word = pack_field(self.operation_mode, MODE_SHIFT, Parameter::OperationMode)?;
        word |= pack_field(
            self.shunt_voltage_conversion,
            VSHCT_SHIFT,
            Parameter::ShuntVoltageConversion,
        )?;
        word |= pack_field(
            self.bus_voltage_conversion,
            VBUSCT_SHIFT,
            Parameter::BusVoltageConversion,
        )?;
        word |= pack_field(self.average_mode, AVERAGE_SHIFT, Parameter::AverageMode)?;
        if self.reset_registers {
            word |= RESET_BIT;
        }
        Ok(word)
    }

    /// Reserved bits (12-14) are ignored.
    pub fn decode(word: u16) -> Self {
        SensorModes {
            operation_mode: unpack_field(word, MODE_SHIFT),
            shunt_voltage_conversion: unpack_field(word, VSHCT_SHIFT),
            bus_voltage_conversion: unpack_field(word, VBUSCT_SHIFT),
            average_mode: unpack_field(word, AVERAGE_SHIFT),
            reset_registers: word & RESET_BIT != 0,
        }
    }
}

/// Calibration register value for the given LSB and shunt, truncated toward
/// zero.
fn calibration_for(current_lsb: f64, shunt_resistance: f64) -> Result<u16, Parameter> {
    let cal = CALIBRATION_CONSTANT / (current_lsb * shunt_resistance);
    if !cal.is_finite() || cal < 1.0 || cal >= f64::from(u16::MAX) + 1.0 {
        return Err(Parameter::Calibration);
    }
    // `as` truncates toward zero
    Ok(cal as u16)
}

pub struct Ina226<I2C> {
    i2c: I2C,
    sensor_address: u8,
    max_expected_current: f64,
    current_lsb: f64,
    shunt_resistance: f64,
}

impl<I2C> Ina226<I2C> {
    /// Takes ownership of the bus. No registers are touched; call
    /// `calibrate` and `configure` explicitly.
    ///
    /// A rejected config hands the bus back alongside the offending field.
    pub fn new(i2c: I2C, config: ComponentConfig) -> Result<Self, (Parameter, I2C)> {
        if let Err(param) = config.validate() {
            return Err((param, i2c));
        }

        Ok(Ina226 {
            i2c,
            sensor_address: config.sensor_address << 1,
            max_expected_current: config.max_expected_current,
            current_lsb: config.max_expected_current / CURRENT_LSB_DIVISOR,
            shunt_resistance: config.shunt_resistance,
        })
    }

    /// Address with the R/W bit slot appended (`address << 1`).
    pub fn sensor_address(&self) -> u8 {
        self.sensor_address
    }

    /// 7-bit address handed to the bus.
    pub fn i2c_address(&self) -> u8 {
        self.sensor_address >> 1
    }

    /// Amps per bit of the current register.
    pub fn current_lsb(&self) -> f64 {
        self.current_lsb
    }

    pub fn shunt_resistance(&self) -> f64 {
        self.shunt_resistance
    }

    pub fn max_expected_current(&self) -> f64 {
        self.max_expected_current
    }

    /// Value `calibrate` writes to the calibration register.
    pub fn calibration_value(&self) -> Result<u16, Parameter> {
        calibration_for(self.current_lsb, self.shunt_resistance)
    }

    /// Gives the bus back.
    pub fn release(self) -> I2C {
        self.i2c
    }
}

#[maybe_async_cfg::maybe(
    idents(hal(sync = "embedded_hal", async = "embedded_hal_async")),
    sync(not(feature = "async")),
    async(feature = "async"),
    keep_self
)]
impl<I2C, E> Ina226<I2C>
where
    I2C: hal::i2c::I2c<Error = E>,
{
    async fn read_register(&mut self, register: Register) -> Result<u16, Error<E>> {
        let mut rx_buffer: [u8; 2] = [0; 2];
        let address = self.i2c_address();

        self.i2c
            .write(address, &[register.addr()])
            .await
            .map_err(Error::I2c)?;
        self.i2c
            .read(address, &mut rx_buffer)
            .await
            .map_err(Error::I2c)?;

        let value = LittleEndian::read_u16(&rx_buffer);
        #[cfg(feature = "defmt")]
        defmt::trace!("INA226 RD {} -> {=u16:#x}", register, value);
        Ok(value)
    }

    async fn write_register(&mut self, register: Register, value: u16) -> Result<(), Error<E>> {
        let mut frame: [u8; 3] = [register.addr(), 0, 0];
        LittleEndian::write_u16(&mut frame[1..], value);
        let address = self.i2c_address();

        #[cfg(feature = "defmt")]
        defmt::trace!("INA226 WR {} <- {=u16:#x}", register, value);
        self.i2c.write(address, &frame).await.map_err(Error::I2c)
    }

    pub async fn read_raw_current(&mut self) -> Result<u16, Error<E>> {
        self.read_register(Register::Current).await
    }

    pub async fn read_raw_voltage(&mut self) -> Result<u16, Error<E>> {
        self.read_register(Register::Voltage).await
    }

    pub async fn read_raw_power(&mut self) -> Result<u16, Error<E>> {
        self.read_register(Register::Power).await
    }

    /// Amps, at 1 mA per bit.
    pub async fn read_current(&mut self) -> Result<f64, Error<E>> {
        Ok(f64::from(self.read_raw_current().await?) * CURRENT_LSB)
    }

    /// Volts, at 1.25 mV per bit.
    pub async fn read_voltage(&mut self) -> Result<f64, Error<E>> {
        Ok(f64::from(self.read_raw_voltage().await?) * VOLTAGE_LSB)
    }

    /// Watts, at 25 mW per bit.
    pub async fn read_power(&mut self) -> Result<f64, Error<E>> {
        Ok(f64::from(self.read_raw_power().await?) * POWER_LSB)
    }

    pub async fn configure(&mut self, modes: &SensorModes) -> Result<(), Error<E>> {
        let word = modes.encode().map_err(Error::InvalidParameter)?;
        self.write_register(Register::Configuration, word).await
    }

    pub async fn read_configuration(&mut self) -> Result<SensorModes, Error<E>> {
        let word = self.read_register(Register::Configuration).await?;
        Ok(SensorModes::decode(word))
    }

    /// Sets the reset bit; the device restores its power-on registers.
    pub async fn reset(&mut self) -> Result<(), Error<E>> {
        self.write_register(Register::Configuration, RESET_BIT).await
    }

    pub async fn calibrate(&mut self) -> Result<(), Error<E>> {
        let cal = self.calibration_value().map_err(Error::InvalidParameter)?;
        #[cfg(feature = "defmt")]
        defmt::debug!("INA226 calibration = {}", cal);
        self.write_register(Register::Calibration, cal).await
    }

    pub async fn read_calibration(&mut self) -> Result<u16, Error<E>> {
        self.read_register(Register::Calibration).await
    }

    pub async fn set_mask_enable(&mut self, bits: u16) -> Result<(), Error<E>> {
        self.write_register(Register::MaskEnable, bits).await
    }

    /// Reading clears the alert and conversion-ready flags on the device.
    pub async fn get_mask_enable(&mut self) -> Result<u16, Error<E>> {
        self.read_register(Register::MaskEnable).await
    }

    pub async fn get_alert_limit(&mut self) -> Result<u16, Error<E>> {
        self.read_register(Register::AlertLimit).await
    }

    pub async fn set_alert_limit(&mut self, limit: u16) -> Result<(), Error<E>> {
        self.write_register(Register::AlertLimit, limit).await
    }
}


#[cfg(all(test, feature = "async"))]
mod async_tests {
    use super::*;
    use embassy_futures::block_on;
    use embedded_hal::i2c::ErrorKind;
    use embedded_hal_mock::eh1::i2c::{Mock as I2cMock, Transaction};
    use float_cmp::approx_eq;
    use pretty_assertions::assert_eq;

    const ADDR: u8 = DEFAULT_ADDRESS;

    fn mock_ina(transactions: &[Transaction]) -> Ina226<I2cMock> {
        let cfg = ComponentConfig::new(1.0, 0.01, ADDR);
        match Ina226::new(I2cMock::new(transactions), cfg) {
            Ok(ina) => ina,
            Err((param, _)) => panic!("config rejected: {param}"),
        }
    }

    #[test]
    fn calibrate_writes_truncated_value() {
        let mut ina = mock_ina(&[Transaction::write(
            ADDR,
            vec![Register::Calibration as u8, 0x89, 0x41],
        )]);
        block_on(ina.calibrate()).unwrap();
        ina.release().done();
    }

    #[test]
    fn alert_limit_round_trip() {
        let mut ina = mock_ina(&[
            Transaction::write(ADDR, vec![Register::AlertLimit as u8, 0x34, 0x12]),
            Transaction::write(ADDR, vec![Register::AlertLimit as u8]),
            Transaction::read(ADDR, vec![0x34, 0x12]),
        ]);
        block_on(ina.set_alert_limit(0x1234)).unwrap();
        assert_eq!(block_on(ina.get_alert_limit()).unwrap(), 0x1234);
        ina.release().done();
    }

    #[test]
    fn read_current_scales_by_one_milliamp() {
        let mut ina = mock_ina(&[
            Transaction::write(ADDR, vec![Register::Current as u8]),
            Transaction::read(ADDR, vec![0xD2, 0x04]),
        ]);
        let current = block_on(ina.read_current()).unwrap();
        assert!(approx_eq!(f64, current, 1.234, epsilon = 1e-9));
        ina.release().done();
    }

    #[test]
    fn configure_rejects_wide_field_without_traffic() {
        let mut ina = mock_ina(&[]);
        let modes = SensorModes {
            bus_voltage_conversion: 9,
            ..SensorModes::default()
        };
        assert_eq!(
            block_on(ina.configure(&modes)),
            Err(Error::InvalidParameter(Parameter::BusVoltageConversion))
        );
        ina.release().done();
    }

    #[test]
    fn transport_error_is_propagated() {
        let mut ina = mock_ina(&[
            Transaction::write(ADDR, vec![Register::MaskEnable as u8, 0x00, 0x80])
                .with_error(ErrorKind::Other),
        ]);
        assert_eq!(
            block_on(ina.set_mask_enable(MaskEnable::ShuntOverVoltage.bits())),
            Err(Error::I2c(ErrorKind::Other))
        );
        ina.release().done();
    }
}
