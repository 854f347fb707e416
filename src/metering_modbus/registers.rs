use serde::Serialize;
use utoipa::ToSchema;

use crate::models::MeterModel;

/// Which leg of the supply a metric belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub enum Phase {
    None,
    L1,
    L2,
    L3,
}

/// All SDM values are IEEE754 float32 spread over two input registers
pub const FLOAT_REGISTER_COUNT: u16 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricDefinition {
    pub name: &'static str,
    pub register: u16,
    pub length: u16,
    pub phase: Phase,
    pub unit: &'static str,
}

const fn metric(name: &'static str, register: u16, phase: Phase, unit: &'static str) -> MetricDefinition {
    MetricDefinition {
        name,
        register,
        length: FLOAT_REGISTER_COUNT,
        phase,
        unit,
    }
}

/* SDM120, SDM220 and SDM230 share the same input register layout */
static SINGLE_PHASE_REGISTERS: [MetricDefinition; 14] = [
    metric("Voltage", 0x0000, Phase::None, "V"),
    metric("Current", 0x0006, Phase::None, "A"),
    metric("Power", 0x000C, Phase::None, "W"),
    metric("ApparentPower", 0x0012, Phase::None, "VA"),
    metric("ReactivePower", 0x0018, Phase::None, "VAr"),
    metric("Cosphi", 0x001E, Phase::None, ""),
    metric("PhaseAngle", 0x0024, Phase::None, "°"),
    metric("Frequency", 0x0046, Phase::None, "Hz"),
    metric("Import", 0x0048, Phase::None, "kWh"),
    metric("Export", 0x004A, Phase::None, "kWh"),
    metric("ReactiveImport", 0x004C, Phase::None, "kVArh"),
    metric("ReactiveExport", 0x004E, Phase::None, "kVArh"),
    metric("Sum", 0x0156, Phase::None, "kWh"),
    metric("ReactiveSum", 0x0158, Phase::None, "kVArh"),
];

static THREE_PHASE_REGISTERS: [MetricDefinition; 46] = [
    metric("Voltage/L1", 0x0000, Phase::L1, "V"),
    metric("Voltage/L2", 0x0002, Phase::L2, "V"),
    metric("Voltage/L3", 0x0004, Phase::L3, "V"),
    metric("Voltage", 0x002A, Phase::None, "V"),
    metric("Current/L1", 0x0006, Phase::L1, "A"),
    metric("Current/L2", 0x0008, Phase::L2, "A"),
    metric("Current/L3", 0x000A, Phase::L3, "A"),
    metric("Current", 0x0030, Phase::None, "A"),
    metric("Power/L1", 0x000C, Phase::L1, "W"),
    metric("Power/L2", 0x000E, Phase::L2, "W"),
    metric("Power/L3", 0x0010, Phase::L3, "W"),
    metric("Power", 0x0034, Phase::None, "W"),
    metric("ApparentPower/L1", 0x0012, Phase::L1, "VA"),
    metric("ApparentPower/L2", 0x0014, Phase::L2, "VA"),
    metric("ApparentPower/L3", 0x0016, Phase::L3, "VA"),
    metric("ApparentPower", 0x0038, Phase::None, "VA"),
    metric("ReactivePower/L1", 0x0018, Phase::L1, "VAr"),
    metric("ReactivePower/L2", 0x001A, Phase::L2, "VAr"),
    metric("ReactivePower/L3", 0x001C, Phase::L3, "VAr"),
    metric("ReactivePower", 0x003C, Phase::None, "VAr"),
    metric("Cosphi/L1", 0x001E, Phase::L1, ""),
    metric("Cosphi/L2", 0x0020, Phase::L2, ""),
    metric("Cosphi/L3", 0x0022, Phase::L3, ""),
    metric("Cosphi", 0x003E, Phase::None, ""),
    metric("PhaseAngle/L1", 0x0024, Phase::L1, "°"),
    metric("PhaseAngle/L2", 0x0026, Phase::L2, "°"),
    metric("PhaseAngle/L3", 0x0028, Phase::L3, "°"),
    metric("Frequency", 0x0046, Phase::None, "Hz"),
    metric("Import", 0x0156, Phase::None, "kWh"),
    metric("Export", 0x0160, Phase::None, "kWh"),
    metric("ReactiveImport", 0x0158, Phase::None, "kVArh"),
    metric("ReactiveExport", 0x0162, Phase::None, "kVArh"),
    metric("Sum", 0x0156, Phase::None, "kWh"),
    metric("ReactiveSum", 0x0158, Phase::None, "kVArh"),
    // line to line voltages
    metric("Voltage/L1-L2", 0x00C8, Phase::None, "V"),
    metric("Voltage/L2-L3", 0x00CA, Phase::None, "V"),
    metric("Voltage/L3-L1", 0x00CC, Phase::None, "V"),
    metric("Current/N", 0x00E0, Phase::None, "A"),
    // harmonic distortion
    metric("THD/VoltageL1", 0x00EA, Phase::L1, "%"),
    metric("THD/VoltageL2", 0x00EC, Phase::L2, "%"),
    metric("THD/VoltageL3", 0x00EE, Phase::L3, "%"),
    metric("THD/CurrentL1", 0x00F0, Phase::L1, "%"),
    metric("THD/CurrentL2", 0x00F2, Phase::L2, "%"),
    metric("THD/CurrentL3", 0x00F4, Phase::L3, "%"),
    metric("THD/VoltageAvg", 0x00F8, Phase::None, "%"),
    metric("THD/CurrentAvg", 0x00FA, Phase::None, "%"),
];

/// Ordered list of metrics to query for a meter family
pub fn get_registers(model: MeterModel) -> &'static [MetricDefinition] {
    match model {
        MeterModel::SDM120 | MeterModel::SDM220 | MeterModel::SDM230 => &SINGLE_PHASE_REGISTERS,
        MeterModel::SDM630 => &THREE_PHASE_REGISTERS,
    }
}
