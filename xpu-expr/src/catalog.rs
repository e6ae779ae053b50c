//! Static catalog of device functions.
//!
//! Every function opcode maps to exactly one [`FuncInfo`]: its SQL-level name, operand
//! types, result type, routine family ([`FuncKind`]) and capability flags. The evaluator
//! dispatches on `kind` and the operand types; nothing else is looked up at runtime.
//!
//! Opcode ids are part of the program wire format.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use rustc_hash::FxHashMap;
use std::sync::OnceLock;
use xpu_types::TypeOpcode;

/// Device kinds a function can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevKind(u8);

impl DevKind {
    pub const GPU: DevKind = DevKind(0x01);
    pub const DPU: DevKind = DevKind(0x02);
    pub const HOST: DevKind = DevKind(0x04);
    pub const ANY: DevKind = DevKind(0x07);

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn from_bits(bits: u8) -> DevKind {
        DevKind(bits & Self::ANY.0)
    }

    #[inline]
    pub const fn contains(self, other: DevKind) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn union(self, other: DevKind) -> DevKind {
        DevKind(self.0 | other.0)
    }

    pub fn name(self) -> &'static str {
        match self.0 {
            0x01 => "gpu",
            0x02 => "dpu",
            0x04 => "host",
            _ => "mixed",
        }
    }
}

/// Routine family a function is evaluated by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FuncKind {
    Cast,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    UPlus,
    Abs,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    Shl,
    Shr,
    Like,
    NotLike,
    ILike,
    NotILike,
    TextCat,
    Concat,
    CharLength,
    OctetLength,
}

impl FuncKind {
    #[inline]
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            FuncKind::Eq | FuncKind::Ne | FuncKind::Lt | FuncKind::Le | FuncKind::Gt | FuncKind::Ge
        )
    }
}

#[derive(Debug)]
pub struct FuncInfo {
    pub opcode: FuncOpcode,
    pub name: &'static str,
    pub args: &'static [TypeOpcode],
    pub result: TypeOpcode,
    pub kind: FuncKind,
    pub devkind: DevKind,
    pub locale_aware: bool,
}

impl FuncInfo {
    /// `concat` takes any number of text arguments.
    #[inline]
    pub fn is_variadic(&self) -> bool {
        self.kind == FuncKind::Concat
    }

    /// Strict functions return NULL as soon as any argument is NULL.
    #[inline]
    pub fn is_strict(&self) -> bool {
        self.kind != FuncKind::Concat
    }
}

macro_rules! device_functions {
    (@locale) => { false };
    (@locale locale_aware $($rest:ident)*) => { true };
    (@locale $other:ident $($rest:ident)*) => { device_functions!(@locale $($rest)*) };
    (@devkind) => { DevKind::ANY };
    (@devkind gpu_only $($rest:ident)*) => { DevKind::GPU.union(DevKind::HOST) };
    (@devkind $other:ident $($rest:ident)*) => { device_functions!(@devkind $($rest)*) };
    (
        $(
            $variant:ident = $id:literal => $name:literal ( $($arg:ident),* ) -> $ret:ident,
            $kind:ident $(, $flag:ident)* ;
        )*
    ) => {
        /// Device function opcode.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, IntoPrimitive, TryFromPrimitive)]
        #[repr(u16)]
        pub enum FuncOpcode {
            $( $variant = $id, )*
        }

        impl FuncOpcode {
            pub const ALL: &'static [FuncOpcode] = &[ $( FuncOpcode::$variant, )* ];

            pub fn info(self) -> &'static FuncInfo {
                match self {
                    $(
                        FuncOpcode::$variant => {
                            static INFO: FuncInfo = FuncInfo {
                                opcode: FuncOpcode::$variant,
                                name: $name,
                                args: &[ $( TypeOpcode::$arg ),* ],
                                result: TypeOpcode::$ret,
                                kind: FuncKind::$kind,
                                devkind: device_functions!(@devkind $($flag)*),
                                locale_aware: device_functions!(@locale $($flag)*),
                            };
                            &INFO
                        }
                    )*
                }
            }
        }
    };
}

device_functions! {
    Int1Pl = 100 => "int1pl" (Int1, Int1) -> Int1, Add;
    Int1Mi = 101 => "int1mi" (Int1, Int1) -> Int1, Sub;
    Int1Mul = 102 => "int1mul" (Int1, Int1) -> Int1, Mul;
    Int1Div = 103 => "int1div" (Int1, Int1) -> Int1, Div;
    Int1Mod = 104 => "int1mod" (Int1, Int1) -> Int1, Mod;
    Int1Um = 105 => "int1um" (Int1) -> Int1, Neg;
    Int1Up = 106 => "int1up" (Int1) -> Int1, UPlus;
    Int1Abs = 107 => "int1abs" (Int1) -> Int1, Abs;
    Int1Eq = 108 => "int1eq" (Int1, Int1) -> Bool, Eq;
    Int1Ne = 109 => "int1ne" (Int1, Int1) -> Bool, Ne;
    Int1Lt = 110 => "int1lt" (Int1, Int1) -> Bool, Lt;
    Int1Le = 111 => "int1le" (Int1, Int1) -> Bool, Le;
    Int1Gt = 112 => "int1gt" (Int1, Int1) -> Bool, Gt;
    Int1Ge = 113 => "int1ge" (Int1, Int1) -> Bool, Ge;
    Int1And = 114 => "int1and" (Int1, Int1) -> Int1, BitAnd;
    Int1Or = 115 => "int1or" (Int1, Int1) -> Int1, BitOr;
    Int1Xor = 116 => "int1xor" (Int1, Int1) -> Int1, BitXor;
    Int1Not = 117 => "int1not" (Int1) -> Int1, BitNot;
    Int1Shl = 118 => "int1shl" (Int1, Int4) -> Int1, Shl;
    Int1Shr = 119 => "int1shr" (Int1, Int4) -> Int1, Shr;
    Int2Pl = 120 => "int2pl" (Int2, Int2) -> Int2, Add;
    Int2Mi = 121 => "int2mi" (Int2, Int2) -> Int2, Sub;
    Int2Mul = 122 => "int2mul" (Int2, Int2) -> Int2, Mul;
    Int2Div = 123 => "int2div" (Int2, Int2) -> Int2, Div;
    Int2Mod = 124 => "int2mod" (Int2, Int2) -> Int2, Mod;
    Int2Um = 125 => "int2um" (Int2) -> Int2, Neg;
    Int2Up = 126 => "int2up" (Int2) -> Int2, UPlus;
    Int2Abs = 127 => "int2abs" (Int2) -> Int2, Abs;
    Int2Eq = 128 => "int2eq" (Int2, Int2) -> Bool, Eq;
    Int2Ne = 129 => "int2ne" (Int2, Int2) -> Bool, Ne;
    Int2Lt = 130 => "int2lt" (Int2, Int2) -> Bool, Lt;
    Int2Le = 131 => "int2le" (Int2, Int2) -> Bool, Le;
    Int2Gt = 132 => "int2gt" (Int2, Int2) -> Bool, Gt;
    Int2Ge = 133 => "int2ge" (Int2, Int2) -> Bool, Ge;
    Int2And = 134 => "int2and" (Int2, Int2) -> Int2, BitAnd;
    Int2Or = 135 => "int2or" (Int2, Int2) -> Int2, BitOr;
    Int2Xor = 136 => "int2xor" (Int2, Int2) -> Int2, BitXor;
    Int2Not = 137 => "int2not" (Int2) -> Int2, BitNot;
    Int2Shl = 138 => "int2shl" (Int2, Int4) -> Int2, Shl;
    Int2Shr = 139 => "int2shr" (Int2, Int4) -> Int2, Shr;
    Int4Pl = 140 => "int4pl" (Int4, Int4) -> Int4, Add;
    Int4Mi = 141 => "int4mi" (Int4, Int4) -> Int4, Sub;
    Int4Mul = 142 => "int4mul" (Int4, Int4) -> Int4, Mul;
    Int4Div = 143 => "int4div" (Int4, Int4) -> Int4, Div;
    Int4Mod = 144 => "int4mod" (Int4, Int4) -> Int4, Mod;
    Int4Um = 145 => "int4um" (Int4) -> Int4, Neg;
    Int4Up = 146 => "int4up" (Int4) -> Int4, UPlus;
    Int4Abs = 147 => "int4abs" (Int4) -> Int4, Abs;
    Int4Eq = 148 => "int4eq" (Int4, Int4) -> Bool, Eq;
    Int4Ne = 149 => "int4ne" (Int4, Int4) -> Bool, Ne;
    Int4Lt = 150 => "int4lt" (Int4, Int4) -> Bool, Lt;
    Int4Le = 151 => "int4le" (Int4, Int4) -> Bool, Le;
    Int4Gt = 152 => "int4gt" (Int4, Int4) -> Bool, Gt;
    Int4Ge = 153 => "int4ge" (Int4, Int4) -> Bool, Ge;
    Int4And = 154 => "int4and" (Int4, Int4) -> Int4, BitAnd;
    Int4Or = 155 => "int4or" (Int4, Int4) -> Int4, BitOr;
    Int4Xor = 156 => "int4xor" (Int4, Int4) -> Int4, BitXor;
    Int4Not = 157 => "int4not" (Int4) -> Int4, BitNot;
    Int4Shl = 158 => "int4shl" (Int4, Int4) -> Int4, Shl;
    Int4Shr = 159 => "int4shr" (Int4, Int4) -> Int4, Shr;
    Int8Pl = 160 => "int8pl" (Int8, Int8) -> Int8, Add;
    Int8Mi = 161 => "int8mi" (Int8, Int8) -> Int8, Sub;
    Int8Mul = 162 => "int8mul" (Int8, Int8) -> Int8, Mul;
    Int8Div = 163 => "int8div" (Int8, Int8) -> Int8, Div;
    Int8Mod = 164 => "int8mod" (Int8, Int8) -> Int8, Mod;
    Int8Um = 165 => "int8um" (Int8) -> Int8, Neg;
    Int8Up = 166 => "int8up" (Int8) -> Int8, UPlus;
    Int8Abs = 167 => "int8abs" (Int8) -> Int8, Abs;
    Int8Eq = 168 => "int8eq" (Int8, Int8) -> Bool, Eq;
    Int8Ne = 169 => "int8ne" (Int8, Int8) -> Bool, Ne;
    Int8Lt = 170 => "int8lt" (Int8, Int8) -> Bool, Lt;
    Int8Le = 171 => "int8le" (Int8, Int8) -> Bool, Le;
    Int8Gt = 172 => "int8gt" (Int8, Int8) -> Bool, Gt;
    Int8Ge = 173 => "int8ge" (Int8, Int8) -> Bool, Ge;
    Int8And = 174 => "int8and" (Int8, Int8) -> Int8, BitAnd;
    Int8Or = 175 => "int8or" (Int8, Int8) -> Int8, BitOr;
    Int8Xor = 176 => "int8xor" (Int8, Int8) -> Int8, BitXor;
    Int8Not = 177 => "int8not" (Int8) -> Int8, BitNot;
    Int8Shl = 178 => "int8shl" (Int8, Int4) -> Int8, Shl;
    Int8Shr = 179 => "int8shr" (Int8, Int4) -> Int8, Shr;
    Int24Pl = 180 => "int24pl" (Int2, Int4) -> Int4, Add;
    Int24Mi = 181 => "int24mi" (Int2, Int4) -> Int4, Sub;
    Int24Mul = 182 => "int24mul" (Int2, Int4) -> Int4, Mul;
    Int24Div = 183 => "int24div" (Int2, Int4) -> Int4, Div;
    Int24Eq = 184 => "int24eq" (Int2, Int4) -> Bool, Eq;
    Int24Ne = 185 => "int24ne" (Int2, Int4) -> Bool, Ne;
    Int24Lt = 186 => "int24lt" (Int2, Int4) -> Bool, Lt;
    Int24Le = 187 => "int24le" (Int2, Int4) -> Bool, Le;
    Int24Gt = 188 => "int24gt" (Int2, Int4) -> Bool, Gt;
    Int24Ge = 189 => "int24ge" (Int2, Int4) -> Bool, Ge;
    Int42Pl = 190 => "int42pl" (Int4, Int2) -> Int4, Add;
    Int42Mi = 191 => "int42mi" (Int4, Int2) -> Int4, Sub;
    Int42Mul = 192 => "int42mul" (Int4, Int2) -> Int4, Mul;
    Int42Div = 193 => "int42div" (Int4, Int2) -> Int4, Div;
    Int42Eq = 194 => "int42eq" (Int4, Int2) -> Bool, Eq;
    Int42Ne = 195 => "int42ne" (Int4, Int2) -> Bool, Ne;
    Int42Lt = 196 => "int42lt" (Int4, Int2) -> Bool, Lt;
    Int42Le = 197 => "int42le" (Int4, Int2) -> Bool, Le;
    Int42Gt = 198 => "int42gt" (Int4, Int2) -> Bool, Gt;
    Int42Ge = 199 => "int42ge" (Int4, Int2) -> Bool, Ge;
    Int28Pl = 200 => "int28pl" (Int2, Int8) -> Int8, Add;
    Int28Mi = 201 => "int28mi" (Int2, Int8) -> Int8, Sub;
    Int28Mul = 202 => "int28mul" (Int2, Int8) -> Int8, Mul;
    Int28Div = 203 => "int28div" (Int2, Int8) -> Int8, Div;
    Int28Eq = 204 => "int28eq" (Int2, Int8) -> Bool, Eq;
    Int28Ne = 205 => "int28ne" (Int2, Int8) -> Bool, Ne;
    Int28Lt = 206 => "int28lt" (Int2, Int8) -> Bool, Lt;
    Int28Le = 207 => "int28le" (Int2, Int8) -> Bool, Le;
    Int28Gt = 208 => "int28gt" (Int2, Int8) -> Bool, Gt;
    Int28Ge = 209 => "int28ge" (Int2, Int8) -> Bool, Ge;
    Int82Pl = 210 => "int82pl" (Int8, Int2) -> Int8, Add;
    Int82Mi = 211 => "int82mi" (Int8, Int2) -> Int8, Sub;
    Int82Mul = 212 => "int82mul" (Int8, Int2) -> Int8, Mul;
    Int82Div = 213 => "int82div" (Int8, Int2) -> Int8, Div;
    Int82Eq = 214 => "int82eq" (Int8, Int2) -> Bool, Eq;
    Int82Ne = 215 => "int82ne" (Int8, Int2) -> Bool, Ne;
    Int82Lt = 216 => "int82lt" (Int8, Int2) -> Bool, Lt;
    Int82Le = 217 => "int82le" (Int8, Int2) -> Bool, Le;
    Int82Gt = 218 => "int82gt" (Int8, Int2) -> Bool, Gt;
    Int82Ge = 219 => "int82ge" (Int8, Int2) -> Bool, Ge;
    Int48Pl = 220 => "int48pl" (Int4, Int8) -> Int8, Add;
    Int48Mi = 221 => "int48mi" (Int4, Int8) -> Int8, Sub;
    Int48Mul = 222 => "int48mul" (Int4, Int8) -> Int8, Mul;
    Int48Div = 223 => "int48div" (Int4, Int8) -> Int8, Div;
    Int48Eq = 224 => "int48eq" (Int4, Int8) -> Bool, Eq;
    Int48Ne = 225 => "int48ne" (Int4, Int8) -> Bool, Ne;
    Int48Lt = 226 => "int48lt" (Int4, Int8) -> Bool, Lt;
    Int48Le = 227 => "int48le" (Int4, Int8) -> Bool, Le;
    Int48Gt = 228 => "int48gt" (Int4, Int8) -> Bool, Gt;
    Int48Ge = 229 => "int48ge" (Int4, Int8) -> Bool, Ge;
    Int84Pl = 230 => "int84pl" (Int8, Int4) -> Int8, Add;
    Int84Mi = 231 => "int84mi" (Int8, Int4) -> Int8, Sub;
    Int84Mul = 232 => "int84mul" (Int8, Int4) -> Int8, Mul;
    Int84Div = 233 => "int84div" (Int8, Int4) -> Int8, Div;
    Int84Eq = 234 => "int84eq" (Int8, Int4) -> Bool, Eq;
    Int84Ne = 235 => "int84ne" (Int8, Int4) -> Bool, Ne;
    Int84Lt = 236 => "int84lt" (Int8, Int4) -> Bool, Lt;
    Int84Le = 237 => "int84le" (Int8, Int4) -> Bool, Le;
    Int84Gt = 238 => "int84gt" (Int8, Int4) -> Bool, Gt;
    Int84Ge = 239 => "int84ge" (Int8, Int4) -> Bool, Ge;
    Float2Pl = 240 => "float2pl" (Float2, Float2) -> Float2, Add, gpu_only;
    Float2Mi = 241 => "float2mi" (Float2, Float2) -> Float2, Sub, gpu_only;
    Float2Mul = 242 => "float2mul" (Float2, Float2) -> Float2, Mul, gpu_only;
    Float2Div = 243 => "float2div" (Float2, Float2) -> Float2, Div, gpu_only;
    Float2Um = 244 => "float2um" (Float2) -> Float2, Neg, gpu_only;
    Float2Up = 245 => "float2up" (Float2) -> Float2, UPlus, gpu_only;
    Float2Abs = 246 => "float2abs" (Float2) -> Float2, Abs, gpu_only;
    Float2Eq = 247 => "float2eq" (Float2, Float2) -> Bool, Eq, gpu_only;
    Float2Ne = 248 => "float2ne" (Float2, Float2) -> Bool, Ne, gpu_only;
    Float2Lt = 249 => "float2lt" (Float2, Float2) -> Bool, Lt, gpu_only;
    Float2Le = 250 => "float2le" (Float2, Float2) -> Bool, Le, gpu_only;
    Float2Gt = 251 => "float2gt" (Float2, Float2) -> Bool, Gt, gpu_only;
    Float2Ge = 252 => "float2ge" (Float2, Float2) -> Bool, Ge, gpu_only;
    Float4Pl = 253 => "float4pl" (Float4, Float4) -> Float4, Add;
    Float4Mi = 254 => "float4mi" (Float4, Float4) -> Float4, Sub;
    Float4Mul = 255 => "float4mul" (Float4, Float4) -> Float4, Mul;
    Float4Div = 256 => "float4div" (Float4, Float4) -> Float4, Div;
    Float4Um = 257 => "float4um" (Float4) -> Float4, Neg;
    Float4Up = 258 => "float4up" (Float4) -> Float4, UPlus;
    Float4Abs = 259 => "float4abs" (Float4) -> Float4, Abs;
    Float4Eq = 260 => "float4eq" (Float4, Float4) -> Bool, Eq;
    Float4Ne = 261 => "float4ne" (Float4, Float4) -> Bool, Ne;
    Float4Lt = 262 => "float4lt" (Float4, Float4) -> Bool, Lt;
    Float4Le = 263 => "float4le" (Float4, Float4) -> Bool, Le;
    Float4Gt = 264 => "float4gt" (Float4, Float4) -> Bool, Gt;
    Float4Ge = 265 => "float4ge" (Float4, Float4) -> Bool, Ge;
    Float8Pl = 266 => "float8pl" (Float8, Float8) -> Float8, Add;
    Float8Mi = 267 => "float8mi" (Float8, Float8) -> Float8, Sub;
    Float8Mul = 268 => "float8mul" (Float8, Float8) -> Float8, Mul;
    Float8Div = 269 => "float8div" (Float8, Float8) -> Float8, Div;
    Float8Um = 270 => "float8um" (Float8) -> Float8, Neg;
    Float8Up = 271 => "float8up" (Float8) -> Float8, UPlus;
    Float8Abs = 272 => "float8abs" (Float8) -> Float8, Abs;
    Float8Eq = 273 => "float8eq" (Float8, Float8) -> Bool, Eq;
    Float8Ne = 274 => "float8ne" (Float8, Float8) -> Bool, Ne;
    Float8Lt = 275 => "float8lt" (Float8, Float8) -> Bool, Lt;
    Float8Le = 276 => "float8le" (Float8, Float8) -> Bool, Le;
    Float8Gt = 277 => "float8gt" (Float8, Float8) -> Bool, Gt;
    Float8Ge = 278 => "float8ge" (Float8, Float8) -> Bool, Ge;
    Float48Pl = 279 => "float48pl" (Float4, Float8) -> Float8, Add;
    Float48Mi = 280 => "float48mi" (Float4, Float8) -> Float8, Sub;
    Float48Mul = 281 => "float48mul" (Float4, Float8) -> Float8, Mul;
    Float48Div = 282 => "float48div" (Float4, Float8) -> Float8, Div;
    Float48Eq = 283 => "float48eq" (Float4, Float8) -> Bool, Eq;
    Float48Ne = 284 => "float48ne" (Float4, Float8) -> Bool, Ne;
    Float48Lt = 285 => "float48lt" (Float4, Float8) -> Bool, Lt;
    Float48Le = 286 => "float48le" (Float4, Float8) -> Bool, Le;
    Float48Gt = 287 => "float48gt" (Float4, Float8) -> Bool, Gt;
    Float48Ge = 288 => "float48ge" (Float4, Float8) -> Bool, Ge;
    Float84Pl = 289 => "float84pl" (Float8, Float4) -> Float8, Add;
    Float84Mi = 290 => "float84mi" (Float8, Float4) -> Float8, Sub;
    Float84Mul = 291 => "float84mul" (Float8, Float4) -> Float8, Mul;
    Float84Div = 292 => "float84div" (Float8, Float4) -> Float8, Div;
    Float84Eq = 293 => "float84eq" (Float8, Float4) -> Bool, Eq;
    Float84Ne = 294 => "float84ne" (Float8, Float4) -> Bool, Ne;
    Float84Lt = 295 => "float84lt" (Float8, Float4) -> Bool, Lt;
    Float84Le = 296 => "float84le" (Float8, Float4) -> Bool, Le;
    Float84Gt = 297 => "float84gt" (Float8, Float4) -> Bool, Gt;
    Float84Ge = 298 => "float84ge" (Float8, Float4) -> Bool, Ge;
    Int1ToInt2 = 299 => "int2(int1)" (Int1) -> Int2, Cast;
    Int1ToInt4 = 300 => "int4(int1)" (Int1) -> Int4, Cast;
    Int1ToInt8 = 301 => "int8(int1)" (Int1) -> Int8, Cast;
    Int2ToInt1 = 302 => "int1(int2)" (Int2) -> Int1, Cast;
    Int2ToInt4 = 303 => "int4(int2)" (Int2) -> Int4, Cast;
    Int2ToInt8 = 304 => "int8(int2)" (Int2) -> Int8, Cast;
    Int4ToInt1 = 305 => "int1(int4)" (Int4) -> Int1, Cast;
    Int4ToInt2 = 306 => "int2(int4)" (Int4) -> Int2, Cast;
    Int4ToInt8 = 307 => "int8(int4)" (Int4) -> Int8, Cast;
    Int8ToInt1 = 308 => "int1(int8)" (Int8) -> Int1, Cast;
    Int8ToInt2 = 309 => "int2(int8)" (Int8) -> Int2, Cast;
    Int8ToInt4 = 310 => "int4(int8)" (Int8) -> Int4, Cast;
    Int2ToFloat4 = 311 => "float4(int2)" (Int2) -> Float4, Cast;
    Int2ToFloat8 = 312 => "float8(int2)" (Int2) -> Float8, Cast;
    Int4ToFloat4 = 313 => "float4(int4)" (Int4) -> Float4, Cast;
    Int4ToFloat8 = 314 => "float8(int4)" (Int4) -> Float8, Cast;
    Int8ToFloat4 = 315 => "float4(int8)" (Int8) -> Float4, Cast;
    Int8ToFloat8 = 316 => "float8(int8)" (Int8) -> Float8, Cast;
    Float4ToInt2 = 317 => "int2(float4)" (Float4) -> Int2, Cast;
    Float4ToInt4 = 318 => "int4(float4)" (Float4) -> Int4, Cast;
    Float4ToInt8 = 319 => "int8(float4)" (Float4) -> Int8, Cast;
    Float8ToInt2 = 320 => "int2(float8)" (Float8) -> Int2, Cast;
    Float8ToInt4 = 321 => "int4(float8)" (Float8) -> Int4, Cast;
    Float8ToInt8 = 322 => "int8(float8)" (Float8) -> Int8, Cast;
    Float2ToFloat4 = 323 => "float4(float2)" (Float2) -> Float4, Cast, gpu_only;
    Float2ToFloat8 = 324 => "float8(float2)" (Float2) -> Float8, Cast, gpu_only;
    Float4ToFloat2 = 325 => "float2(float4)" (Float4) -> Float2, Cast, gpu_only;
    Float8ToFloat2 = 326 => "float2(float8)" (Float8) -> Float2, Cast, gpu_only;
    Float4ToFloat8 = 327 => "float8(float4)" (Float4) -> Float8, Cast;
    Float8ToFloat4 = 328 => "float4(float8)" (Float8) -> Float4, Cast;
    Float2ToInt4 = 329 => "int4(float2)" (Float2) -> Int4, Cast, gpu_only;
    Int4ToFloat2 = 330 => "float2(int4)" (Int4) -> Float2, Cast, gpu_only;
    BoolToInt4 = 331 => "int4(bool)" (Bool) -> Int4, Cast;
    Int4ToBool = 332 => "bool(int4)" (Int4) -> Bool, Cast;
    BoolEq = 333 => "booleq" (Bool, Bool) -> Bool, Eq;
    BoolNe = 334 => "boolne" (Bool, Bool) -> Bool, Ne;
    TextEq = 335 => "texteq" (Text, Text) -> Bool, Eq;
    TextNe = 336 => "textne" (Text, Text) -> Bool, Ne;
    TextLt = 337 => "textlt" (Text, Text) -> Bool, Lt, locale_aware;
    TextLe = 338 => "textle" (Text, Text) -> Bool, Le, locale_aware;
    TextGt = 339 => "textgt" (Text, Text) -> Bool, Gt, locale_aware;
    TextGe = 340 => "textge" (Text, Text) -> Bool, Ge, locale_aware;
    TextCat = 341 => "textcat" (Text, Text) -> Text, TextCat;
    Concat = 342 => "concat" () -> Text, Concat;
    TextLike = 343 => "textlike" (Text, Text) -> Bool, Like;
    TextNLike = 344 => "textnlike" (Text, Text) -> Bool, NotLike;
    TextIcLike = 345 => "texticlike" (Text, Text) -> Bool, ILike, locale_aware;
    TextIcNLike = 346 => "texticnlike" (Text, Text) -> Bool, NotILike, locale_aware;
    TextLen = 347 => "textlen" (Text) -> Int4, CharLength;
    ByteaEq = 348 => "byteaeq" (Bytea, Bytea) -> Bool, Eq;
    ByteaNe = 349 => "byteane" (Bytea, Bytea) -> Bool, Ne;
    ByteaLt = 350 => "bytealt" (Bytea, Bytea) -> Bool, Lt;
    ByteaLe = 351 => "byteale" (Bytea, Bytea) -> Bool, Le;
    ByteaGt = 352 => "byteagt" (Bytea, Bytea) -> Bool, Gt;
    ByteaGe = 353 => "byteage" (Bytea, Bytea) -> Bool, Ge;
    ByteaCat = 354 => "byteacat" (Bytea, Bytea) -> Bytea, TextCat;
    ByteaLike = 355 => "bytealike" (Bytea, Bytea) -> Bool, Like;
    ByteaNLike = 356 => "byteanlike" (Bytea, Bytea) -> Bool, NotLike;
    ByteaOctetLen = 357 => "byteaoctetlen" (Bytea) -> Int4, OctetLength;
}

impl FuncOpcode {
    #[inline]
    pub fn name(self) -> &'static str {
        self.info().name
    }

    /// Look a function up by its catalog name.
    pub fn by_name(name: &str) -> Option<FuncOpcode> {
        static BY_NAME: OnceLock<FxHashMap<&'static str, FuncOpcode>> = OnceLock::new();
        BY_NAME
            .get_or_init(|| FuncOpcode::ALL.iter().map(|&f| (f.name(), f)).collect())
            .get(name)
            .copied()
    }

    /// The cast from `from` to `to`, if the catalog has one.
    pub fn cast(from: TypeOpcode, to: TypeOpcode) -> Option<FuncOpcode> {
        FuncOpcode::ALL.iter().copied().find(|f| {
            let info = f.info();
            info.kind == FuncKind::Cast && info.args == [from] && info.result == to
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn catalog_is_consistent() {
        let mut names = HashSet::new();
        for &f in FuncOpcode::ALL {
            let info = f.info();
            assert_eq!(info.opcode, f);
            assert!(names.insert(info.name), "duplicate name {}", info.name);
            assert_eq!(FuncOpcode::try_from(u16::from(f)).unwrap(), f);
            if info.kind.is_comparison() {
                assert_eq!(info.result, TypeOpcode::Bool, "{}", info.name);
            }
            if !info.is_variadic() {
                assert!(!info.args.is_empty(), "{}", info.name);
            }
        }
    }

    #[test]
    fn lookup_by_name_and_cast() {
        assert_eq!(FuncOpcode::by_name("int4pl"), Some(FuncOpcode::Int4Pl));
        assert_eq!(FuncOpcode::by_name("int48mul"), Some(FuncOpcode::Int48Mul));
        assert_eq!(FuncOpcode::by_name("no_such_fn"), None);
        assert_eq!(
            FuncOpcode::cast(TypeOpcode::Float8, TypeOpcode::Int4),
            Some(FuncOpcode::Float8ToInt4)
        );
        assert_eq!(FuncOpcode::cast(TypeOpcode::Text, TypeOpcode::Int4), None);
    }

    #[test]
    fn capability_flags() {
        assert!(FuncOpcode::TextLt.info().locale_aware);
        assert!(!FuncOpcode::TextEq.info().locale_aware);
        assert!(FuncOpcode::TextIcLike.info().locale_aware);
        assert!(!FuncOpcode::Float2Pl.info().devkind.contains(DevKind::DPU));
        assert!(FuncOpcode::Int8Pl.info().devkind.contains(DevKind::DPU));
        assert!(FuncOpcode::Concat.info().is_variadic());
        assert!(!FuncOpcode::Concat.info().is_strict());
    }
}
