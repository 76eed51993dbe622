//! MAX31855 thermocouple-to-digital frame decoding.
//!
//! Frame layout (big-endian, 32 bits):
//! - D31..D18: thermocouple temperature, signed, 0.25 °C per bit
//! - D16: fault
//! - D15..D4: cold-junction temperature, signed, 0.0625 °C per bit
//! - D2: short to VCC, D1: short to GND, D0: open circuit

/// Raw four bytes clocked out of the amplifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame(pub [u8; 4]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FaultFlags {
    pub short_to_vcc: bool,
    pub short_to_gnd: bool,
    pub open_circuit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameReading {
    Valid {
        /// Thermocouple temperature, °C
        temperature: f64,
        /// Cold-junction (internal) temperature, °C
        internal: f64,
    },
    Fault(FaultFlags),
}

impl RawFrame {
    pub fn decode(&self) -> FrameReading {
        let [b0, b1, b2, b3] = self.0;

        if b1 & 0x01 != 0 {
            return FrameReading::Fault(FaultFlags {
                short_to_vcc: b3 & 0x04 != 0,
                short_to_gnd: b3 & 0x02 != 0,
                open_circuit: b3 & 0x01 != 0,
            });
        }

        // Arithmetic shifts keep the sign of the 14 and 12 bit fields.
        let temperature = (i16::from_be_bytes([b0, b1]) >> 2) as f64 / 4.0;
        let internal = (i16::from_be_bytes([b2, b3]) >> 4) as f64 / 16.0;

        FrameReading::Valid {
            temperature,
            internal,
        }
    }

    /// Encode a reading the way the amplifier would report it. Used by
    /// simulated hardware.
    pub fn encode(temperature: f64, internal: f64) -> Self {
        let tc = (libm::round(temperature * 4.0) as i16) << 2;
        let cj = (libm::round(internal * 16.0) as i16) << 4;
        let [b0, b1] = tc.to_be_bytes();
        let [b2, b3] = cj.to_be_bytes();
        // D17 and D3 are reserved zero bits, so the fault bit stays clear.
        Self([b0, b1 & !0x03, b2, b3 & !0x0F])
    }

    pub fn encode_fault(flags: FaultFlags) -> Self {
        let mut b3 = 0u8;
        if flags.short_to_vcc {
            b3 |= 0x04;
        }
        if flags.short_to_gnd {
            b3 |= 0x02;
        }
        if flags.open_circuit {
            b3 |= 0x01;
        }
        Self([0, 0x01, 0, b3])
    }
}
