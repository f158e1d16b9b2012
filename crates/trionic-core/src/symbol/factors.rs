//! Correction factors and display units keyed by symbol name

/// Scale applied to a symbol's raw integer. Names not listed scale by 1.
pub fn correction_factor(name: &str) -> f64 {
    match name {
        "IgnProt.fi_Offset"
        | "Out.X_AccPedal"
        | "Out.X_AccPos"
        | "Out.fi_Ignition"
        | "Out.PWM_BoostCntrl"
        | "In.v_Vehicle"
        | "In.p_AirAmbient"
        | "IgnMastProt.fi_Offset" => 0.1,
        "DisplProt.LambdaScanner" | "Lambda.LambdaInt" => 0.01,
        "ECMStat.p_Diff"
        | "ECMStat.p_DiffThrot"
        | "In.p_AirBefThrottle"
        | "ActualIn.p_AirBefThrottle"
        | "In.p_AirInlet"
        | "ActualIn.p_AirInlet" => 0.001,
        _ => 1.0,
    }
}

/// T5 symbols use their own scaling
pub fn t5_correction_factor(name: &str) -> f64 {
    match name {
        "P_medel" | "P_Manifold10" => 0.1,
        _ => 1.0,
    }
}

pub fn unit_for(name: &str) -> &'static str {
    match name {
        "Out.X_AccPedal" | "Out.X_AccPos" | "Out.PWM_BoostCntrl" => "%",
        "In.p_AirAmbient" => "kPa",
        "In.v_Vehicle" => "km/h",
        "IgnProt.fi_Offset" | "IgnMastProt.fi_Offset" => "°",
        "Out.fi_Ignition" => "° BTDC",
        "ECMStat.p_Diff"
        | "ECMStat.p_DiffThrot"
        | "In.p_AirBefThrottle"
        | "ActualIn.p_AirBefThrottle"
        | "In.p_AirInlet"
        | "ActualIn.p_AirInlet" => "bar",
        "m_Request" | "MAF.m_AirInlet" | "AirMassMast.m_Request" => "mg/c",
        "ActualIn.n_Engine" => "rpm",
        _ => "",
    }
}
